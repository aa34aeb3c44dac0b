//! The uniform invocation contract shared by built-in and synthesized capabilities.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::CapabilityError;

/// What part of the pipeline a capability serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Reads a source descriptor and returns its records.
    Extractor,
    /// Transforms `{"records", "params"}` into the rows/columns contract.
    Operation,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKind::Extractor => write!(f, "extractor"),
            CapabilityKind::Operation => write!(f, "operation"),
        }
    }
}

/// Declared input/output shape of a capability, in prose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityShape {
    pub input: String,
    pub output: String,
}

impl CapabilityShape {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// Shape shared by every source extractor.
    pub fn source_extractor() -> Self {
        Self::new(
            "source descriptor {id, kind, location, format?, metadata}",
            "extracted payload (rows/columns, data, or content)",
        )
    }

    /// Shape shared by every row operation.
    pub fn row_operation() -> Self {
        Self::new(
            "{\"records\": [row...], \"params\": {...}}",
            "{\"rows\": [row...], \"columns\": [string...]}",
        )
    }
}

/// A named, invocable unit of extraction or transformation.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Stable registry name (snake_case).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn kind(&self) -> CapabilityKind;

    fn shape(&self) -> CapabilityShape;

    /// Run the capability.
    async fn invoke(&self, input: Value) -> Result<Value, CapabilityError>;
}

/// Whether `name` is an acceptable capability identifier.
pub fn is_valid_capability_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_names() {
        assert!(is_valid_capability_name("extract_xml"));
        assert!(is_valid_capability_name("normalize"));
        assert!(is_valid_capability_name("extract_v2"));
        assert!(!is_valid_capability_name(""));
        assert!(!is_valid_capability_name("Extract"));
        assert!(!is_valid_capability_name("2extract"));
        assert!(!is_valid_capability_name("../etc/passwd"));
        assert!(!is_valid_capability_name("extract-xml"));
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&CapabilityKind::Extractor).expect("serialize");
        assert_eq!(json, "\"extractor\"");
        assert_eq!(CapabilityKind::Operation.to_string(), "operation");
    }
}
