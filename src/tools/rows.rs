//! Helpers for the rows/columns record contract.

use serde_json::{json, Map, Value};

use crate::error::CapabilityError;

/// A single record.
pub type Row = Map<String, Value>;

/// Column names in first-seen order across all rows.
pub fn column_order(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

/// Wrap rows into `{"rows", "columns"}`, giving every row the same keys.
///
/// Fields a row lacks are filled with `null`.
pub fn rows_output(rows: Vec<Row>) -> Value {
    let columns = column_order(&rows);
    let rows: Vec<Value> = rows
        .into_iter()
        .map(|mut row| {
            for column in &columns {
                row.entry(column.clone()).or_insert(Value::Null);
            }
            Value::Object(row)
        })
        .collect();
    json!({ "rows": rows, "columns": columns })
}

/// Read `input["records"]` as a list of objects.
pub fn records_from_input(input: &Value) -> Result<Vec<Row>, CapabilityError> {
    let records = match input.get("records") {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(other) => {
            return Err(CapabilityError::InvalidInput(format!(
                "'records' must be an array, got {}",
                type_name(other)
            )))
        }
    };

    records
        .iter()
        .enumerate()
        .map(|(i, record)| match record {
            Value::Object(map) => Ok(map.clone()),
            other => Err(CapabilityError::InvalidInput(format!(
                "record {} is not an object ({})",
                i,
                type_name(other)
            ))),
        })
        .collect()
}

/// Read `input["params"]`, defaulting to an empty object.
pub fn params_from_input(input: &Value) -> Map<String, Value> {
    input
        .get("params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Numeric view of a value; numeric strings count.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    }
}

/// Round to four decimal places.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// JSON number for a finite float, `null` otherwise.
pub fn number_value(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Flatten an extracted payload into row objects.
///
/// Uses `rows` when present, then a `data` array of objects, and otherwise
/// treats the payload object itself as a single row.
pub fn payload_rows(payload: &Value) -> Vec<Value> {
    if let Some(rows) = payload.get("rows").and_then(Value::as_array) {
        return rows.iter().filter(|r| r.is_object()).cloned().collect();
    }
    if let Some(data) = payload.get("data") {
        match data {
            Value::Array(items) => {
                return items.iter().filter(|r| r.is_object()).cloned().collect();
            }
            Value::Object(_) => return vec![data.clone()],
            _ => {}
        }
    }
    match payload {
        Value::Object(_) => vec![payload.clone()],
        Value::Array(items) => items.iter().filter(|r| r.is_object()).cloned().collect(),
        _ => Vec::new(),
    }
}

/// Stringify a scalar for comparisons and display.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
