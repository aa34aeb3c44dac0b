//! Capability synthesis.
//!
//! When a stage discovers it lacks a capability, [`ToolSynthesizer`] asks the
//! oracle for an implementation, tests it in the sandbox, repairs it against
//! the failure detail, and finally persists and registers it:
//!
//! ```text
//! Generate -> SandboxTest -> Persist
//!                 ^    |
//!                 |    v (failed, repairs < 3)
//!               CodeFixer
//! ```
//!
//! After three repairs the next failure ends the run with a `failed` result.

pub mod contract;
pub mod probe;
pub mod sandbox;
pub mod script;
pub mod types;

pub use contract::validate_output;
pub use probe::{probe_inputs, sandbox_test};
pub use sandbox::{ProcessSandbox, SandboxConfig, SandboxError, SandboxOutcome, SandboxRunner};
pub use script::{ScriptCapability, ScriptLoader};
pub use types::{extractor_name_for_format, CapabilitySpec, SynthesisResult, SynthesisStatus};

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::error::RegistryError;
use crate::llm::ReasoningOracle;
use crate::metrics::MetricsCollector;
use crate::prompts::{build_fix_prompt, build_generation_prompt, CAPABILITY_SYSTEM_PROMPT};
use crate::registry::{
    source_digest, CapabilityManifest, CapabilityOrigin, CapabilityRegistry, CapabilityShape, ManifestEntry,
};

/// Repairs allowed before a synthesis run gives up.
pub const MAX_REPAIR_ATTEMPTS: u32 = 3;

/// File extension of persisted capability sources.
pub const SOURCE_EXTENSION: &str = "py";

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("Invalid capability spec: {0}")]
    InvalidSpec(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// States of a synthesis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisStep {
    Generate,
    SandboxTest,
    CodeFixer,
    Persist,
}

/// Where a run goes after a sandbox test.
///
/// `None` means the run is over with a failure.
pub fn route_after_sandbox_test(passed: bool, repair_attempts: u32) -> Option<SynthesisStep> {
    if passed {
        Some(SynthesisStep::Persist)
    } else if repair_attempts < MAX_REPAIR_ATTEMPTS {
        Some(SynthesisStep::CodeFixer)
    } else {
        None
    }
}

/// Generates, tests, repairs and registers missing capabilities.
pub struct ToolSynthesizer {
    oracle: ReasoningOracle,
    registry: Arc<CapabilityRegistry>,
    sandbox: Arc<dyn SandboxRunner>,
    capability_dir: PathBuf,
    manifest_lock: tokio::sync::Mutex<()>,
    metrics: MetricsCollector,
}

impl ToolSynthesizer {
    /// Create a synthesizer persisting sources under `capability_dir`.
    ///
    /// The oracle is re-targeted at the code-generation system prompt.
    pub fn new(
        oracle: &ReasoningOracle,
        registry: Arc<CapabilityRegistry>,
        sandbox: Arc<dyn SandboxRunner>,
        capability_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            oracle: oracle.with_system_prompt(CAPABILITY_SYSTEM_PROMPT),
            registry,
            sandbox,
            capability_dir: capability_dir.into(),
            manifest_lock: tokio::sync::Mutex::new(()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn capability_dir(&self) -> &Path {
        &self.capability_dir
    }

    pub fn sandbox(&self) -> Arc<dyn SandboxRunner> {
        Arc::clone(&self.sandbox)
    }

    /// Run one synthesis for `spec`.
    ///
    /// Never fails outright: every problem ends up in a `failed` result.
    pub async fn synthesize(&self, spec: &CapabilitySpec) -> SynthesisResult {
        let name = spec.name();
        let lock = self.registry.registration_lock(name);
        let result = {
            let _guard = lock.lock().await;
            self.synthesize_serialized(spec).await
        };
        self.registry.release_registration_lock(name, lock);
        result
    }

    /// Generate-test-persist loop; callers hold the registration lock for `spec`.
    async fn synthesize_serialized(&self, spec: &CapabilitySpec) -> SynthesisResult {
        let name = spec.name();
        if let Some(existing) = self.reuse_existing(name) {
            tracing::info!(capability = %name, "Capability registered concurrently, reusing it");
            self.metrics.record_synthesis("reused", 0);
            return existing;
        }

        let started = Instant::now();
        let spec_json = spec.to_prompt_json();
        let mut step = SynthesisStep::Generate;
        let mut source = String::new();
        let mut repair_attempts = 0u32;
        let mut last_failure = String::new();

        let result = loop {
            tracing::debug!(capability = %name, ?step, repair_attempts, "Synthesis step");
            match step {
                SynthesisStep::Generate => {
                    let prompt = build_generation_prompt(&spec_json, name);
                    match self.request_code(&prompt).await {
                        Some(code) => {
                            source = code;
                            step = SynthesisStep::SandboxTest;
                        }
                        None => {
                            break SynthesisResult::failed(name, None, "code generator returned no code", 0);
                        }
                    }
                }
                SynthesisStep::SandboxTest => {
                    let outcome = sandbox_test(self.sandbox.as_ref(), spec, &source).await;
                    if let Err(detail) = &outcome {
                        tracing::info!(capability = %name, repair_attempts, failure = %detail, "Sandbox test failed");
                        last_failure = detail.clone();
                    }
                    match route_after_sandbox_test(outcome.is_ok(), repair_attempts) {
                        Some(next) => step = next,
                        None => {
                            break SynthesisResult::failed(
                                name,
                                Some(source.clone()),
                                format!(
                                    "sandbox test failed after {} repairs: {}",
                                    repair_attempts, last_failure
                                ),
                                repair_attempts,
                            );
                        }
                    }
                }
                SynthesisStep::CodeFixer => {
                    repair_attempts += 1;
                    let prompt = build_fix_prompt(&spec_json, name, &source, &last_failure);
                    match self.request_code(&prompt).await {
                        Some(code) => source = code,
                        None => {
                            tracing::warn!(capability = %name, repair_attempts, "Code fixer returned no code; retesting previous source");
                        }
                    }
                    step = SynthesisStep::SandboxTest;
                }
                SynthesisStep::Persist => match self.persist(spec, &source).await {
                    Ok(location) => {
                        break SynthesisResult::success(name, source.clone(), location, repair_attempts);
                    }
                    Err(e) => {
                        break SynthesisResult::failed(
                            name,
                            Some(source.clone()),
                            format!("persist failed: {}", e),
                            repair_attempts,
                        );
                    }
                },
            }
        };

        self.metrics
            .record_synthesis(&result.status.to_string(), result.repair_attempts);
        tracing::info!(
            capability = %name,
            status = %result.status,
            repair_attempts = result.repair_attempts,
            duration_ms = started.elapsed().as_millis() as u64,
            "Synthesis finished"
        );
        result
    }

    fn reuse_existing(&self, name: &str) -> Option<SynthesisResult> {
        self.registry.lookup(name)?;
        let (location, source) = match self.registry.origin(name) {
            Some(CapabilityOrigin::Synthesized { location, .. }) => {
                let source = std::fs::read_to_string(&location).ok();
                (Some(location), source)
            }
            _ => (None, None),
        };
        Some(SynthesisResult {
            capability_name: name.to_string(),
            status: SynthesisStatus::Success,
            source,
            location,
            validated: false,
            error: None,
            repair_attempts: 0,
        })
    }

    async fn request_code(&self, prompt: &str) -> Option<String> {
        match self.oracle.ask_json(prompt, None).await {
            Ok((object, _)) => object
                .get("code")
                .and_then(|c| c.as_str())
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            Err(e) => {
                tracing::warn!(error = %e, "Oracle gave no usable code");
                None
            }
        }
    }

    /// Write the source, record it in the manifest and register it.
    async fn persist(&self, spec: &CapabilitySpec, source: &str) -> Result<PathBuf, SynthesisError> {
        tokio::fs::create_dir_all(&self.capability_dir).await?;
        let file = format!("{}.{}", spec.name(), SOURCE_EXTENSION);
        let location = self.capability_dir.join(&file);
        tokio::fs::write(&location, source).await?;

        {
            let _manifest_guard = self.manifest_lock.lock().await;
            let mut manifest = CapabilityManifest::load(&self.capability_dir)?;
            manifest.upsert(ManifestEntry {
                name: spec.name().to_string(),
                description: spec.description().to_string(),
                kind: spec.kind(),
                input_shape: spec.input_shape().to_string(),
                output_shape: spec.output_shape().to_string(),
                file,
                sha256: source_digest(source),
                created_at: Utc::now(),
            });
            manifest.save(&self.capability_dir)?;
        }

        let capability = ScriptCapability::new(
            spec.name(),
            spec.description(),
            spec.kind(),
            CapabilityShape::new(spec.input_shape(), spec.output_shape()),
            source,
            location.clone(),
            Arc::clone(&self.sandbox),
        );
        self.registry
            .register(spec.name(), Arc::new(capability), source, location.clone())?;

        tracing::info!(capability = %spec.name(), location = %location.display(), "Persisted synthesized capability");
        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_after_sandbox_test() {
        assert_eq!(route_after_sandbox_test(true, 0), Some(SynthesisStep::Persist));
        assert_eq!(route_after_sandbox_test(true, 3), Some(SynthesisStep::Persist));
        assert_eq!(route_after_sandbox_test(false, 0), Some(SynthesisStep::CodeFixer));
        assert_eq!(route_after_sandbox_test(false, 2), Some(SynthesisStep::CodeFixer));
        assert_eq!(route_after_sandbox_test(false, 3), None);
    }
}
