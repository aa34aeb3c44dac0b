//! Sandbox acceptance test for a candidate capability source.

use serde_json::{json, Value};

use super::contract::validate_output;
use super::sandbox::{SandboxOutcome, SandboxRunner};
use super::types::CapabilitySpec;
use crate::registry::CapabilityKind;

/// Synthetic inputs derived from the spec's declared input shape.
///
/// Extractor probes point at files that do not exist, so a correct extractor
/// either raises a not-found error or returns an `{"error": ...}` object.
pub fn probe_inputs(spec: &CapabilitySpec) -> Vec<Value> {
    match spec.kind() {
        CapabilityKind::Extractor => {
            let format = spec
                .name()
                .strip_prefix("extract_")
                .unwrap_or("dat")
                .to_string();
            let location = format!("/nonexistent/aria_probe.{}", format);
            vec![
                json!({
                    "id": "probe",
                    "kind": "file",
                    "location": location,
                    "format": format,
                    "metadata": {},
                }),
                json!({"path_or_url": location, "data_format": format, "metadata": {}}),
                json!({"path": location}),
            ]
        }
        CapabilityKind::Operation => vec![
            json!({"records": [], "params": {}}),
            json!({
                "records": [
                    {"label": "a", "value": 1, "date": "2024-01-01"},
                    {"label": "b", "value": 2, "date": "2024-02-01"},
                ],
                "params": {},
            }),
        ],
    }
}

/// Run every probe and decide whether the source passes.
///
/// Returns the failure detail fed to the repair prompt.
pub async fn sandbox_test(
    runner: &dyn SandboxRunner,
    spec: &CapabilitySpec,
    source: &str,
) -> Result<(), String> {
    let probes = probe_inputs(spec);
    let mut mismatches = Vec::new();

    for probe in &probes {
        let outcome = runner
            .run(source, spec.name(), probe)
            .await
            .map_err(|e| format!("sandbox error: {}", e))?;

        match outcome {
            SandboxOutcome::Returned(value) => {
                validate_output(&value).map_err(|v| format!("output contract violation: {}", v))?;
            }
            SandboxOutcome::ResourceNotFound(_) => {}
            SandboxOutcome::ArgumentMismatch(detail) => mismatches.push(detail),
            SandboxOutcome::Raised(detail) => {
                return Err(format!("raised on probe input {}: {}", probe, detail));
            }
            SandboxOutcome::MissingCallable => {
                return Err(format!("no callable named '{}' is defined", spec.name()));
            }
            SandboxOutcome::LoadFailed(detail) => {
                return Err(format!("source failed to load: {}", detail));
            }
            SandboxOutcome::TimedOut(timeout) => {
                return Err(format!("execution exceeded the {:?} sandbox timeout", timeout));
            }
        }
    }

    if mismatches.len() == probes.len() {
        return Err(format!(
            "no probe input matched the function signature: {}",
            mismatches.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::sandbox::SandboxError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedRunner {
        outcomes: Mutex<Vec<SandboxOutcome>>,
    }

    impl ScriptedRunner {
        fn new(mut outcomes: Vec<SandboxOutcome>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
            }
        }
    }

    #[async_trait]
    impl SandboxRunner for ScriptedRunner {
        async fn run(&self, _: &str, _: &str, _: &Value) -> Result<SandboxOutcome, SandboxError> {
            Ok(self
                .outcomes
                .lock()
                .expect("lock not poisoned")
                .pop()
                .unwrap_or(SandboxOutcome::ResourceNotFound("probe".to_string())))
        }
    }

    fn xml_spec() -> CapabilitySpec {
        CapabilitySpec::for_file_format("xml").expect("spec")
    }

    #[test]
    fn test_extractor_probes_use_format() {
        let probes = probe_inputs(&xml_spec());
        assert_eq!(probes.len(), 3);
        assert_eq!(probes[0]["location"], "/nonexistent/aria_probe.xml");
    }

    #[tokio::test]
    async fn test_not_found_everywhere_passes() {
        let runner = ScriptedRunner::new(vec![]);
        assert!(sandbox_test(&runner, &xml_spec(), "src").await.is_ok());
    }

    #[tokio::test]
    async fn test_some_mismatches_are_skipped() {
        let runner = ScriptedRunner::new(vec![
            SandboxOutcome::ArgumentMismatch("KeyError: 'path'".to_string()),
            SandboxOutcome::Returned(json!({"error": "file missing"})),
            SandboxOutcome::ArgumentMismatch("KeyError: 'location'".to_string()),
        ]);
        assert!(sandbox_test(&runner, &xml_spec(), "src").await.is_ok());
    }

    #[tokio::test]
    async fn test_all_mismatches_fail() {
        let runner = ScriptedRunner::new(vec![
            SandboxOutcome::ArgumentMismatch("a".to_string()),
            SandboxOutcome::ArgumentMismatch("b".to_string()),
            SandboxOutcome::ArgumentMismatch("c".to_string()),
        ]);
        let err = sandbox_test(&runner, &xml_spec(), "src").await.expect_err("fails");
        assert!(err.contains("no probe input matched"));
    }

    #[tokio::test]
    async fn test_contract_violation_fails() {
        let runner = ScriptedRunner::new(vec![SandboxOutcome::Returned(json!({"data": []}))]);
        let err = sandbox_test(&runner, &xml_spec(), "src").await.expect_err("fails");
        assert!(err.contains("output contract violation"));
    }

    #[tokio::test]
    async fn test_raised_and_missing_callable_fail() {
        let runner = ScriptedRunner::new(vec![SandboxOutcome::Raised("ValueError: boom".to_string())]);
        assert!(sandbox_test(&runner, &xml_spec(), "src").await.is_err());

        let runner = ScriptedRunner::new(vec![SandboxOutcome::MissingCallable]);
        let err = sandbox_test(&runner, &xml_spec(), "src").await.expect_err("fails");
        assert!(err.contains("extract_xml"));
    }
}
