//! aria-forge: an agent pipeline that turns raw activity data into analysed,
//! rendered reports.
//!
//! A run identifies the domain of its sources, extracts and transforms the
//! data (synthesizing missing extractors and operations on the fly), pulls
//! context from a knowledge base, performs a TRIZ analysis and renders the
//! report in several formats. Runs can suspend for a human to confirm the
//! domain and resume later from a checkpoint.

pub mod cli;
pub mod error;
pub mod llm;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod prompts;
pub mod registry;
pub mod report;
pub mod synthesis;
pub mod tools;
pub mod utils;

// Re-export commonly used error types
pub use error::{CapabilityError, LlmError, RegistryError, RenderError};

pub use pipeline::{
    HumanCorrection, HumanPrompt, PipelineConfig, PipelineError, PipelineOrchestrator, PipelineState, RunOutcome,
    RunRequest,
};
