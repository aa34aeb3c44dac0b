//! Pipeline orchestrator driving a run through the stage graph.
//!
//! The orchestrator owns every collaborator a run needs (oracle, registry,
//! synthesizer, checkpoint store, knowledge base, renderers) and is shared
//! between concurrent runs behind an `Arc`. Each run owns its own
//! [`PipelineState`]; the registry is the only shared mutable resource.
//!
//! A run starts at `domain_identifier` and loops `step -> route` until
//! `report_generator` finishes or the run suspends in front of
//! `human_checkpoint`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::llm::{LlmProvider, OracleConfig, ReasoningOracle};
use crate::memory::ContextCompressor;
use crate::metrics::MetricsCollector;
use crate::prompts::ARIA_SYSTEM_PROMPT;
use crate::registry::{CapabilityRegistry, ReloadReport};
use crate::report::{default_renderers, Renderer};
use crate::synthesis::{ProcessSandbox, SandboxConfig, SandboxRunner, ScriptLoader, ToolSynthesizer};
use crate::tools::{register_builtins, KnowledgeBase, PlaceholderKnowledgeBase};

use super::checkpoint::{validate_thread_id, CheckpointError, CheckpointStore, InMemoryCheckpointStore};
use super::config::{ConfigError, PipelineConfig};
use super::routing::next_stage;
use super::state::{InvalidTransition, PipelineState, RunStatus, SourceDescriptor, Stage, VisitStatus};

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Checkpoint store error.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Capability registry error.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// No suspended run is stored under the thread id.
    #[error("No checkpoint found for thread {0}")]
    CheckpointNotFound(String),

    /// Resume was requested for a run that is not suspended.
    #[error("Thread {thread_id} is not waiting for human input (status: {status})")]
    NotWaitingForHuman { thread_id: String, status: RunStatus },

    /// The run request itself is unusable.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Initialization failed.
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// Input of [`PipelineOrchestrator::start_run`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub sources: Vec<SourceDescriptor>,
    /// Empty means every built-in format.
    #[serde(default)]
    pub output_formats: BTreeSet<String>,
    /// Generated when absent.
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub user_instruction: Option<String>,
}

impl RunRequest {
    pub fn new(sources: Vec<SourceDescriptor>) -> Self {
        Self {
            sources,
            ..Self::default()
        }
    }

    pub fn with_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_formats = formats.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.user_instruction = Some(instruction.into());
        self
    }
}

/// What a suspended run asks the human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanPrompt {
    pub thread_id: String,
    pub domain: String,
    pub domain_confidence: f64,
    pub reporting_period: String,
    pub kpis: Vec<String>,
    pub question: String,
}

impl HumanPrompt {
    fn from_state(state: &PipelineState) -> Self {
        let clarification = state
            .clarification_question
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .unwrap_or("Please confirm or correct.");
        Self {
            thread_id: state.thread_id.clone(),
            domain: state.domain.clone(),
            domain_confidence: state.domain_confidence,
            reporting_period: state.reporting_period.clone(),
            kpis: state.kpis.clone(),
            question: format!(
                "I identified the domain as '{}' (confidence: {}%). {}",
                state.domain,
                (state.domain_confidence * 100.0).round() as u32,
                clarification
            ),
        }
    }
}

/// Answer to a [`HumanPrompt`]. Absent or empty fields keep the guess.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HumanCorrection {
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub reporting_period: Option<String>,
    #[serde(default)]
    pub kpis: Option<Vec<String>>,
}

impl HumanCorrection {
    /// Accept the guess unchanged.
    pub fn confirm() -> Self {
        Self::default()
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_period(mut self, period: impl Into<String>) -> Self {
        self.reporting_period = Some(period.into());
        self
    }

    pub fn with_kpis<I, S>(mut self, kpis: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kpis = Some(kpis.into_iter().map(Into::into).collect());
        self
    }

    fn apply(&self, state: &mut PipelineState) {
        if let Some(domain) = self.domain.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            state.domain = domain.to_string();
        }
        if let Some(period) = self
            .reporting_period
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            state.reporting_period = period.to_string();
        }
        if let Some(kpis) = &self.kpis {
            let kpis: Vec<String> = kpis
                .iter()
                .map(|k| k.trim())
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            if !kpis.is_empty() {
                state.kpis = kpis;
            }
        }
        state.set_domain_confidence(1.0);
        state.clarification_question = None;
    }
}

/// How a call into the orchestrator ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The run reached a terminal status (`done` or `failed`).
    Completed(PipelineState),
    /// The run halted in front of `human_checkpoint`.
    Suspended { state: PipelineState, prompt: HumanPrompt },
}

impl RunOutcome {
    pub fn state(&self) -> &PipelineState {
        match self {
            RunOutcome::Completed(state) => state,
            RunOutcome::Suspended { state, .. } => state,
        }
    }

    pub fn into_state(self) -> PipelineState {
        match self {
            RunOutcome::Completed(state) => state,
            RunOutcome::Suspended { state, .. } => state,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, RunOutcome::Suspended { .. })
    }

    pub fn prompt(&self) -> Option<&HumanPrompt> {
        match self {
            RunOutcome::Suspended { prompt, .. } => Some(prompt),
            RunOutcome::Completed(_) => None,
        }
    }
}

/// Progress emitted after every executed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageUpdate {
    pub thread_id: String,
    pub stage: Stage,
    pub status: VisitStatus,
    pub iteration: u32,
    /// Top-level state fields the stage changed.
    pub changes: Vec<String>,
}

/// Item of [`PipelineOrchestrator::start_run_streaming`].
#[derive(Debug, Clone)]
pub enum RunEvent {
    Stage(StageUpdate),
    /// Final marker: completed or suspended.
    Finished(RunOutcome),
}

/// Counters over the lifetime of one orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub runs_suspended: u64,
    pub degraded_reports: u64,
}

#[derive(Default)]
struct StatsCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    suspended: AtomicU64,
    degraded: AtomicU64,
}

/// Result of one [`PipelineOrchestrator::step`].
pub(crate) enum Step {
    Advanced { update: StageUpdate, next: Option<Stage> },
    Suspended(HumanPrompt),
}

/// Builder wiring an orchestrator from its collaborators.
///
/// Only the oracle (or a provider to build it from) is required.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    oracle: Option<ReasoningOracle>,
    registry: Option<Arc<CapabilityRegistry>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    knowledge: Option<Arc<dyn KnowledgeBase>>,
    sandbox: Option<Arc<dyn SandboxRunner>>,
    renderers: Option<BTreeMap<String, Arc<dyn Renderer>>>,
}

impl OrchestratorBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn oracle(mut self, oracle: ReasoningOracle) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Build the oracle from a provider and the configured model settings.
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        let mut oracle_config = OracleConfig::default()
            .with_temperature(self.config.temperature)
            .with_timeout(self.config.oracle_timeout)
            .with_system_prompt(ARIA_SYSTEM_PROMPT);
        if !self.config.model.is_empty() {
            oracle_config = oracle_config.with_model(self.config.model.clone());
        }
        self.oracle = Some(ReasoningOracle::new(provider, oracle_config));
        self
    }

    pub fn registry(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn knowledge(mut self, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn SandboxRunner>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Replace the renderer set. Keys are output format names.
    pub fn renderers(mut self, renderers: BTreeMap<String, Arc<dyn Renderer>>) -> Self {
        self.renderers = Some(renderers);
        self
    }

    /// Add or replace one renderer on top of the defaults.
    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        let renderers = self.renderers.get_or_insert_with(default_renderers);
        renderers.insert(renderer.format().to_string(), renderer);
        self
    }

    pub fn build(self) -> Result<PipelineOrchestrator, PipelineError> {
        self.config.validate()?;
        let oracle = self
            .oracle
            .ok_or_else(|| PipelineError::InitializationFailed("no oracle or LLM provider configured".to_string()))?;

        let registry = match self.registry {
            Some(registry) => registry,
            None => {
                let registry = Arc::new(CapabilityRegistry::new());
                register_builtins(&registry)?;
                registry
            }
        };
        let sandbox = self.sandbox.unwrap_or_else(|| {
            Arc::new(ProcessSandbox::new(
                SandboxConfig::default()
                    .with_interpreter(self.config.sandbox_interpreter.clone())
                    .with_timeout(self.config.sandbox_timeout),
            ))
        });
        let compressor = ContextCompressor::new(oracle.clone(), self.config.compressor_config());
        let synthesizer = ToolSynthesizer::new(
            &oracle,
            Arc::clone(&registry),
            Arc::clone(&sandbox),
            self.config.capability_dir.clone(),
        );

        let metrics = MetricsCollector::new();
        metrics.set_registered_capabilities(registry.len());

        Ok(PipelineOrchestrator {
            config: self.config,
            oracle,
            compressor,
            registry,
            synthesizer,
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
            knowledge: self
                .knowledge
                .unwrap_or_else(|| Arc::new(PlaceholderKnowledgeBase)),
            renderers: self.renderers.unwrap_or_else(default_renderers),
            metrics,
            stats: StatsCounters::default(),
        })
    }
}

/// Main pipeline orchestrator that coordinates all components.
pub struct PipelineOrchestrator {
    pub(crate) config: PipelineConfig,
    pub(crate) oracle: ReasoningOracle,
    pub(crate) compressor: ContextCompressor,
    pub(crate) registry: Arc<CapabilityRegistry>,
    pub(crate) synthesizer: ToolSynthesizer,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) knowledge: Arc<dyn KnowledgeBase>,
    pub(crate) renderers: BTreeMap<String, Arc<dyn Renderer>>,
    pub(crate) metrics: MetricsCollector,
    stats: StatsCounters,
}

impl PipelineOrchestrator {
    pub fn builder(config: PipelineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Re-register synthesized capabilities recorded in the manifest under
    /// the configured capability directory.
    pub fn reload_capabilities(&self) -> Result<ReloadReport, PipelineError> {
        let loader = ScriptLoader::new(self.synthesizer.sandbox());
        let report = self.registry.reload(self.synthesizer.capability_dir(), &loader)?;
        self.metrics.set_registered_capabilities(self.registry.len());
        tracing::info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            "Reloaded synthesized capabilities"
        );
        Ok(report)
    }

    /// Returns a snapshot of the run counters.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            runs_started: self.stats.started.load(Ordering::Relaxed),
            runs_completed: self.stats.completed.load(Ordering::Relaxed),
            runs_failed: self.stats.failed.load(Ordering::Relaxed),
            runs_suspended: self.stats.suspended.load(Ordering::Relaxed),
            degraded_reports: self.stats.degraded.load(Ordering::Relaxed),
        }
    }

    /// Run a new request until it completes or suspends.
    pub async fn start_run(&self, request: RunRequest) -> Result<RunOutcome, PipelineError> {
        let state = self.initial_state(request)?;
        self.drive(state, Stage::DomainIdentifier).await
    }

    /// Like [`start_run`](Self::start_run), yielding a [`StageUpdate`] after
    /// every executed stage and a final [`RunEvent::Finished`].
    pub fn start_run_streaming(
        &self,
        request: RunRequest,
    ) -> impl Stream<Item = Result<RunEvent, PipelineError>> + Send + '_ {
        async_stream::try_stream! {
            let mut state = self.initial_state(request)?;
            let mut stage = Stage::DomainIdentifier;
            loop {
                match self.step(&mut state, stage).await? {
                    Step::Advanced { update, next } => {
                        yield RunEvent::Stage(update);
                        match next {
                            Some(next) => stage = next,
                            None => {
                                yield RunEvent::Finished(RunOutcome::Completed(state));
                                break;
                            }
                        }
                    }
                    Step::Suspended(prompt) => {
                        yield RunEvent::Finished(RunOutcome::Suspended { state, prompt });
                        break;
                    }
                }
            }
        }
    }

    /// Continue a run suspended at `human_checkpoint`.
    ///
    /// A checkpoint that cannot be decoded ends the run as `failed` instead
    /// of returning an error.
    pub async fn resume_run(
        &self,
        thread_id: &str,
        correction: HumanCorrection,
    ) -> Result<RunOutcome, PipelineError> {
        let mut state = match self.checkpoints.load(thread_id).await {
            Ok(Some(state)) => state,
            Ok(None) => return Err(PipelineError::CheckpointNotFound(thread_id.to_string())),
            Err(e) if e.is_corrupt() => {
                tracing::error!(thread_id = %thread_id, error = %e, "Checkpoint unreadable, failing run");
                let mut state = PipelineState::new(thread_id, Vec::new(), BTreeSet::new(), None);
                state.push_error(format!("resume: {}", e));
                state.transition_to(RunStatus::Failed)?;
                self.metrics.record_run("failed", 0.0);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return Ok(RunOutcome::Completed(state));
            }
            Err(e) => return Err(e.into()),
        };

        if state.status != RunStatus::WaitingForHuman {
            return Err(PipelineError::NotWaitingForHuman {
                thread_id: thread_id.to_string(),
                status: state.status,
            });
        }

        state.transition_to(RunStatus::Running)?;
        self.metrics.run_started();
        tracing::info!(thread_id = %thread_id, "Resuming run after human checkpoint");

        let started = Instant::now();
        correction.apply(&mut state);
        state.current_stage = Some(Stage::HumanCheckpoint);
        let summary = format!(
            "domain confirmed as '{}' ({}), {} KPIs",
            state.domain,
            state.reporting_period,
            state.kpis.len()
        );
        state.record_visit(Stage::HumanCheckpoint, VisitStatus::Completed, summary);
        self.metrics
            .record_stage(Stage::HumanCheckpoint.as_str(), started.elapsed().as_secs_f64());

        let outcome = self.drive(state, Stage::DataExtractor).await?;
        if !outcome.is_suspended() {
            if let Err(e) = self.checkpoints.delete(thread_id).await {
                tracing::warn!(thread_id = %thread_id, error = %e, "Failed to delete checkpoint of finished run");
            }
        }
        Ok(outcome)
    }

    fn initial_state(&self, request: RunRequest) -> Result<PipelineState, PipelineError> {
        if request.sources.is_empty() {
            return Err(PipelineError::InvalidRequest("at least one source is required".to_string()));
        }
        let thread_id = request
            .thread_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        validate_thread_id(&thread_id)
            .map_err(|_| PipelineError::InvalidRequest(format!("invalid thread id '{}'", thread_id)))?;
        let state = PipelineState::new(
            thread_id,
            request.sources,
            request.output_formats,
            request.user_instruction,
        );
        self.metrics.run_started();
        self.stats.started.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            thread_id = %state.thread_id,
            sources = state.sources.len(),
            formats = ?state.output_formats,
            "Starting run"
        );
        Ok(state)
    }

    async fn drive(&self, mut state: PipelineState, entry: Stage) -> Result<RunOutcome, PipelineError> {
        let mut stage = entry;
        loop {
            match self.step(&mut state, stage).await? {
                Step::Advanced { next: Some(next), .. } => stage = next,
                Step::Advanced { next: None, .. } => return Ok(RunOutcome::Completed(state)),
                Step::Suspended(prompt) => return Ok(RunOutcome::Suspended { state, prompt }),
            }
        }
    }

    /// Execute `stage`, record it and pick the next one.
    pub(crate) async fn step(&self, state: &mut PipelineState, stage: Stage) -> Result<Step, PipelineError> {
        if stage == Stage::HumanCheckpoint {
            return self.suspend(state).await.map(Step::Suspended);
        }

        let stage = self.guard_stage_visits(state, stage);
        let before = snapshot(state);
        let errors_before = state.errors.len();
        state.current_stage = Some(stage);

        let started = Instant::now();
        let summary = self.execute(state, stage).await;
        self.metrics.record_stage(stage.as_str(), started.elapsed().as_secs_f64());

        let status = if state.errors.len() > errors_before {
            VisitStatus::CompletedWithErrors
        } else {
            VisitStatus::Completed
        };
        state.record_visit(stage, status, summary);

        let route = next_stage(stage, state);
        if let Some(branch) = route.branch {
            let outcome = route.next.map(|s| s.as_str()).unwrap_or("end");
            tracing::info!(
                thread_id = %state.thread_id,
                stage = %stage,
                next = outcome,
                condition = %branch.condition,
                "Routing decision"
            );
            state.record_decision(stage, branch.condition, outcome, branch.rationale);
        }

        let update = StageUpdate {
            thread_id: state.thread_id.clone(),
            stage,
            status,
            iteration: state.iteration,
            changes: changed_fields(&before, &snapshot(state)),
        };

        if route.next.is_none() {
            self.finish(state);
        }
        Ok(Step::Advanced {
            update,
            next: route.next,
        })
    }

    fn guard_stage_visits(&self, state: &mut PipelineState, stage: Stage) -> Stage {
        let limit = self.config.max_stage_visits;
        if stage == Stage::ReportGenerator || state.stage_history.len() < limit {
            return stage;
        }
        state.push_error(format!(
            "orchestrator: stage limit of {} visits reached before {}; forcing report",
            limit, stage
        ));
        state.degraded_report = true;
        state.record_decision(
            stage,
            format!("stage_visits={} limit={}", state.stage_history.len(), limit),
            Stage::ReportGenerator.as_str(),
            "stage-visit guard tripped",
        );
        Stage::ReportGenerator
    }

    async fn suspend(&self, state: &mut PipelineState) -> Result<HumanPrompt, PipelineError> {
        state.current_stage = Some(Stage::HumanCheckpoint);
        state.transition_to(RunStatus::WaitingForHuman)?;
        self.checkpoints.save(&state.thread_id, state).await?;

        self.metrics.run_stopped();
        self.stats.suspended.fetch_add(1, Ordering::Relaxed);
        let prompt = HumanPrompt::from_state(state);
        tracing::info!(
            thread_id = %state.thread_id,
            domain = %state.domain,
            confidence = state.domain_confidence,
            "Run suspended for human confirmation"
        );
        Ok(prompt)
    }

    fn finish(&self, state: &PipelineState) {
        let elapsed = (Utc::now() - state.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.metrics.record_run(&state.status.to_string(), elapsed);
        self.metrics.run_stopped();

        match state.status {
            RunStatus::Failed => self.stats.failed.fetch_add(1, Ordering::Relaxed),
            _ => self.stats.completed.fetch_add(1, Ordering::Relaxed),
        };
        if state.degraded_report {
            self.stats.degraded.fetch_add(1, Ordering::Relaxed);
        }
        tracing::info!(
            thread_id = %state.thread_id,
            status = %state.status,
            iterations = state.iteration,
            stages = state.stage_history.len(),
            errors = state.errors.len(),
            degraded = state.degraded_report,
            "Run finished"
        );
    }

    pub(crate) fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }
}

fn snapshot(state: &PipelineState) -> Value {
    serde_json::to_value(state).unwrap_or(Value::Null)
}

/// Top-level keys whose values differ, ignoring bookkeeping fields.
fn changed_fields(before: &Value, after: &Value) -> Vec<String> {
    const IGNORED: &[&str] = &["stage_history", "current_stage", "decisions"];
    let (Some(before), Some(after)) = (before.as_object(), after.as_object()) else {
        return Vec::new();
    };
    after
        .iter()
        .filter(|(key, _)| !IGNORED.contains(&key.as_str()))
        .filter(|(key, value)| before.get(key.as_str()) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect()
}
