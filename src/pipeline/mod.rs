//! Pipeline orchestration for report generation.
//!
//! # Architecture
//!
//! - **Orchestrator**: owns the collaborators and drives a run through the
//!   stage graph, suspending at the human checkpoint
//! - **Stages**: one method per stage, each writing its results into the
//!   run state
//! - **Routing**: pure functions choosing the next stage
//! - **State**: the record a run accumulates, persisted while suspended
//! - **Checkpoint**: in-memory, file and SQLite stores for suspended runs
//! - **Config**: paths, timeouts and limits, from YAML and `ARIA_*` variables
//!
//! # Stage graph
//!
//! ```text
//! domain_identifier ─┬─ research_agent ───┐
//!                    ├─ human_checkpoint ─┤
//!                    └────────────────────┴─> data_extractor <────────────┐
//!                                                  │                      │
//!                          error_handler <─────────┤                      │
//!                                                  v                      │
//!                      tool_builder_agent <── data_operator               │
//!                              │                   │                      │
//!                              └──> rag_retriever <┘                      │
//!                                        │                                │
//!                                  data_consolidator ──> triz_analyzer ───┘
//!                                                              │
//!                                                      report_generator
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use aria_forge::pipeline::{PipelineConfig, PipelineOrchestrator, RunRequest, SourceDescriptor, SourceKind};
//!
//! let orchestrator = PipelineOrchestrator::builder(PipelineConfig::from_env()?)
//!     .provider(Arc::new(LiteLlmClient::from_env()?))
//!     .build()?;
//!
//! let request = RunRequest::new(vec![SourceDescriptor::new("q3", SourceKind::File, "data/q3.csv")])
//!     .with_formats(["markdown", "html"]);
//!
//! match orchestrator.start_run(request).await? {
//!     RunOutcome::Completed(state) => println!("{} artifacts", state.artifacts.len()),
//!     RunOutcome::Suspended { prompt, .. } => println!("{}", prompt.question),
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod orchestrator;
pub mod preview;
pub mod routing;
pub mod stages;
pub mod state;

pub use checkpoint::{
    validate_thread_id, CheckpointError, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
    SqliteCheckpointStore,
};
pub use config::{ConfigError, PipelineConfig};
pub use orchestrator::{
    HumanCorrection, HumanPrompt, OrchestratorBuilder, PipelineError, PipelineOrchestrator, PipelineStats,
    RunEvent, RunOutcome, RunRequest, StageUpdate,
};
pub use routing::{
    next_stage, Route, DOMAIN_AMBIGUITY_THRESHOLD, HUMAN_ESCALATION_THRESHOLD, MAX_REFINEMENT_ITERATIONS,
    REFINEMENT_SUFFICIENCY_THRESHOLD,
};
pub use state::{
    ExtractedRecord, PipelineState, Recommendation, RoutingDecision, RunStatus, SourceDescriptor, SourceKind,
    Stage, StageVisit, TrizAnalysis, VisitStatus,
};
