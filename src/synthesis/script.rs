//! Synthesized capabilities backed by a persisted source file.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use super::contract::{error_message, validate_output};
use super::sandbox::{SandboxOutcome, SandboxRunner};
use crate::error::{CapabilityError, RegistryError};
use crate::registry::{Capability, CapabilityKind, CapabilityLoader, CapabilityShape, ManifestEntry};

/// A capability whose implementation runs in the sandbox on every call.
pub struct ScriptCapability {
    name: String,
    description: String,
    kind: CapabilityKind,
    shape: CapabilityShape,
    source: String,
    location: PathBuf,
    sandbox: Arc<dyn SandboxRunner>,
}

impl ScriptCapability {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        kind: CapabilityKind,
        shape: CapabilityShape,
        source: impl Into<String>,
        location: impl Into<PathBuf>,
        sandbox: Arc<dyn SandboxRunner>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            shape,
            source: source.into(),
            location: location.into(),
            sandbox,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn location(&self) -> &PathBuf {
        &self.location
    }
}

#[async_trait]
impl Capability for ScriptCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    fn shape(&self) -> CapabilityShape {
        self.shape.clone()
    }

    async fn invoke(&self, input: Value) -> Result<Value, CapabilityError> {
        let outcome = self
            .sandbox
            .run(&self.source, &self.name, &input)
            .await
            .map_err(|e| CapabilityError::Execution(e.to_string()))?;

        match outcome {
            SandboxOutcome::Returned(value) => {
                validate_output(&value).map_err(CapabilityError::ContractViolation)?;
                if let Some(message) = error_message(&value) {
                    return Err(CapabilityError::Reported(message.to_string()));
                }
                Ok(value)
            }
            SandboxOutcome::ResourceNotFound(detail) => Err(CapabilityError::ResourceNotFound(detail)),
            SandboxOutcome::ArgumentMismatch(detail) => Err(CapabilityError::InvalidInput(detail)),
            SandboxOutcome::Raised(detail) | SandboxOutcome::LoadFailed(detail) => {
                Err(CapabilityError::Execution(detail))
            }
            SandboxOutcome::MissingCallable => Err(CapabilityError::Execution(format!(
                "source defines no callable named '{}'",
                self.name
            ))),
            SandboxOutcome::TimedOut(timeout) => Err(CapabilityError::Timeout(timeout)),
        }
    }
}

/// Rebuilds [`ScriptCapability`] instances from manifest entries.
pub struct ScriptLoader {
    sandbox: Arc<dyn SandboxRunner>,
}

impl ScriptLoader {
    pub fn new(sandbox: Arc<dyn SandboxRunner>) -> Self {
        Self { sandbox }
    }
}

impl CapabilityLoader for ScriptLoader {
    fn load(
        &self,
        entry: &ManifestEntry,
        source: String,
        location: PathBuf,
    ) -> Result<Arc<dyn Capability>, RegistryError> {
        Ok(Arc::new(ScriptCapability::new(
            entry.name.clone(),
            entry.description.clone(),
            entry.kind,
            CapabilityShape::new(entry.input_shape.clone(), entry.output_shape.clone()),
            source,
            location,
            Arc::clone(&self.sandbox),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::sandbox::SandboxError;
    use serde_json::json;

    struct FixedRunner(SandboxOutcome);

    #[async_trait]
    impl SandboxRunner for FixedRunner {
        async fn run(&self, _: &str, _: &str, _: &Value) -> Result<SandboxOutcome, SandboxError> {
            Ok(self.0.clone())
        }
    }

    fn capability(outcome: SandboxOutcome) -> ScriptCapability {
        ScriptCapability::new(
            "extract_xml",
            "xml",
            CapabilityKind::Extractor,
            CapabilityShape::source_extractor(),
            "def extract_xml(s): ...",
            "/tmp/extract_xml.py",
            Arc::new(FixedRunner(outcome)),
        )
    }

    #[tokio::test]
    async fn test_invoke_returns_rows() {
        let rows = json!({"rows": [{"a": 1}], "columns": ["a"]});
        let output = capability(SandboxOutcome::Returned(rows.clone()))
            .invoke(json!({}))
            .await
            .expect("invoke");
        assert_eq!(output, rows);
    }

    #[tokio::test]
    async fn test_invoke_maps_failures() {
        let err = capability(SandboxOutcome::Returned(json!({"error": "bad xml"})))
            .invoke(json!({}))
            .await
            .expect_err("error object");
        assert_eq!(err.to_string(), "Capability reported: bad xml");

        let err = capability(SandboxOutcome::ResourceNotFound("/x.xml".to_string()))
            .invoke(json!({}))
            .await
            .expect_err("not found");
        assert!(matches!(err, CapabilityError::ResourceNotFound(_)));

        let err = capability(SandboxOutcome::Returned(json!({"rows": [{"a": 1}, {"b": 2}], "columns": []})))
            .invoke(json!({}))
            .await
            .expect_err("contract");
        assert!(matches!(err, CapabilityError::ContractViolation(_)));
    }
}
