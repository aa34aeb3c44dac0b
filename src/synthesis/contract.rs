//! Output contract shared by every capability.
//!
//! A capability returns either `{"error": "<message>"}` or
//! `{"rows": [object...], "columns": [string...]}` where every row has the
//! same key set.

use serde_json::Value;
use std::collections::BTreeSet;

/// Validate a capability output against the contract.
///
/// Returns a human-readable violation on failure.
pub fn validate_output(output: &Value) -> Result<(), String> {
    let Some(object) = output.as_object() else {
        return Err(format!("expected an object, got {}", kind_of(output)));
    };

    if let Some(error) = object.get("error") {
        return match error {
            Value::String(_) => Ok(()),
            other => Err(format!("'error' must be a string, got {}", kind_of(other))),
        };
    }

    let rows = match object.get("rows") {
        Some(Value::Array(rows)) => rows,
        Some(other) => return Err(format!("'rows' must be a list, got {}", kind_of(other))),
        None => {
            let keys: Vec<&String> = object.keys().collect();
            return Err(format!("missing key 'rows' (got keys {:?})", keys));
        }
    };

    match object.get("columns") {
        Some(Value::Array(columns)) => {
            if let Some(bad) = columns.iter().find(|c| !c.is_string()) {
                return Err(format!("'columns' must contain strings, found {}", kind_of(bad)));
            }
        }
        Some(other) => return Err(format!("'columns' must be a list, got {}", kind_of(other))),
        None => return Err("missing key 'columns'".to_string()),
    }

    let mut expected: Option<BTreeSet<&str>> = None;
    for (i, row) in rows.iter().enumerate() {
        let Some(fields) = row.as_object() else {
            return Err(format!("row {} must be an object, got {}", i, kind_of(row)));
        };
        let keys: BTreeSet<&str> = fields.keys().map(String::as_str).collect();
        match &expected {
            None => expected = Some(keys),
            Some(first) if *first != keys => {
                return Err(format!(
                    "rows have inconsistent keys: row 0 has {:?}, row {} has {:?}",
                    first, i, keys
                ));
            }
            Some(_) => {}
        }
    }

    Ok(())
}

/// The error message of an `{"error": ...}` output, if it is one.
pub fn error_message(output: &Value) -> Option<&str> {
    output.get("error").and_then(Value::as_str)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
