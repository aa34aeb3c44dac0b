//! LLM prompts for the report pipeline.
//!
//! # Architecture
//!
//! - [`analysis`] - Prompts for the oracle-driven pipeline stages (domain
//!   identification, operation planning, TRIZ analysis)
//! - [`synthesis`] - Generation and repair prompts for synthesized capabilities
//! - [`memory`] - Conversation summarization prompt used by the context compressor
//!
//! Every task prompt opens with a `TASK:` banner line so transcripts stay
//! greppable by stage.

pub mod analysis;
pub mod memory;
pub mod synthesis;

pub use analysis::{build_domain_prompt, build_operation_plan_prompt, build_triz_prompt};
pub use memory::build_summary_prompt;
pub use synthesis::{build_fix_prompt, build_generation_prompt, CAPABILITY_SYSTEM_PROMPT};

/// System prompt shared by every oracle call made by the pipeline.
pub const ARIA_SYSTEM_PROMPT: &str = r#"You are ARIA (Autonomous Report Intelligence Analyst), an analyst of activity reports across industries and organisational levels.

## WORKING RULES

1. Reason before acting: state what you know, what is missing and what the next step needs.
2. Never fill a data gap with an assumption. If data is missing, say so.
3. Every statement in an analysis must be backed by the data you were given.
4. When asked for JSON, reply with a single valid JSON object and nothing else.

## DOMAIN IDENTIFICATION

Infer the sector, organisational level, reporting period and the standard KPIs
for that sector. Proceed on your own when confident; otherwise ask ONE targeted
clarifying question. Ask for deeper research when the domain is too specific to
analyse reliably.

## TRIZ ANALYSIS

Formulate technical contradictions (improving X degrades Y) and physical
contradictions (X must be both A and not-A), define the Ideal Final Result,
map contradictions to the 40 inventive principles, and separate root causes
from symptoms. Recommendations carry an owner, a timeline and a priority.
"#;
