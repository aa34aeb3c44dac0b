//! Capability specs and synthesis results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

use super::SynthesisError;
use crate::registry::{is_valid_capability_name, CapabilityKind};

/// Registry name of the extractor for a file format: `extract_<format>`.
pub fn extractor_name_for_format(format: &str) -> String {
    let suffix: String = format
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("extract_{}", suffix)
}

/// Description of a capability the pipeline needs but lacks.
///
/// Built once by the stage that detects the gap; read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    name: String,
    description: String,
    kind: CapabilityKind,
    input_shape: String,
    output_shape: String,
    example: String,
}

impl CapabilitySpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        kind: CapabilityKind,
        input_shape: impl Into<String>,
        output_shape: impl Into<String>,
        example: impl Into<String>,
    ) -> Result<Self, SynthesisError> {
        let name = name.into();
        if !is_valid_capability_name(&name) {
            return Err(SynthesisError::InvalidSpec(format!(
                "'{}' is not a valid capability name",
                name
            )));
        }
        Ok(Self {
            name,
            description: description.into(),
            kind,
            input_shape: input_shape.into(),
            output_shape: output_shape.into(),
            example: example.into(),
        })
    }

    /// Spec for an extractor of a file format the built-ins do not parse.
    pub fn for_file_format(format: &str) -> Result<Self, SynthesisError> {
        let format = format.trim().to_lowercase();
        let name = extractor_name_for_format(&format);
        let suffix = name.trim_start_matches("extract_").to_string();
        Self::new(
            name,
            format!(
                "Extract all records from a .{} file into flat rows. Nested structures are \
                 flattened recursively and parent attributes propagate to child rows.",
                format
            ),
            CapabilityKind::Extractor,
            "dict with keys: location (str, path to the file), format (str), metadata (dict)",
            "{\"rows\": list[dict], \"columns\": list[str]}",
            format!(
                "extract_{}({{\"location\": \"/data/report.{}\", \"format\": \"{}\", \"metadata\": {{}}}})",
                suffix, format, format
            ),
        )
    }

    /// Parse the `missing_capability` object of an operation plan.
    ///
    /// Returns `None` when the object is absent, null or unusable.
    pub fn from_plan(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let text = |key: &str| {
            object
                .get(key)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        };
        Self::new(
            text("name"),
            text("description"),
            CapabilityKind::Operation,
            object
                .get("input_shape")
                .map(|_| text("input_shape"))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "{\"records\": list[dict], \"params\": dict}".to_string()),
            object
                .get("output_shape")
                .map(|_| text("output_shape"))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "{\"rows\": list[dict], \"columns\": list[str]}".to_string()),
            text("example"),
        )
        .ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    pub fn input_shape(&self) -> &str {
        &self.input_shape
    }

    pub fn output_shape(&self) -> &str {
        &self.output_shape
    }

    pub fn example(&self) -> &str {
        &self.example
    }

    /// Pretty JSON used in generation and repair prompts.
    pub fn to_prompt_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStatus {
    Success,
    Failed,
}

impl fmt::Display for SynthesisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthesisStatus::Success => write!(f, "success"),
            SynthesisStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one synthesis run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub capability_name: String,
    pub status: SynthesisStatus,
    pub source: Option<String>,
    pub location: Option<PathBuf>,
    /// Set by the caller after its own smoke test.
    pub validated: bool,
    pub error: Option<String>,
    pub repair_attempts: u32,
}

impl SynthesisResult {
    pub fn success(name: &str, source: String, location: PathBuf, repair_attempts: u32) -> Self {
        Self {
            capability_name: name.to_string(),
            status: SynthesisStatus::Success,
            source: Some(source),
            location: Some(location),
            validated: false,
            error: None,
            repair_attempts,
        }
    }

    pub fn failed(name: &str, source: Option<String>, error: impl Into<String>, repair_attempts: u32) -> Self {
        Self {
            capability_name: name.to_string(),
            status: SynthesisStatus::Failed,
            source,
            location: None,
            validated: false,
            error: Some(error.into()),
            repair_attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SynthesisStatus::Success
    }
}
