//! LLM integration for aria-forge.
//!
//! [`LlmProvider`] is the transport seam (one OpenAI-compatible client ships
//! with the crate); [`ReasoningOracle`] layers prompt assembly, timeouts and
//! JSON extraction on top of it for the pipeline stages.
//!
//! ```ignore
//! use aria_forge::llm::{LiteLlmClient, ReasoningOracle};
//! use std::sync::Arc;
//!
//! let client = LiteLlmClient::from_env()?;
//! let oracle = ReasoningOracle::with_defaults(Arc::new(client));
//! let reply = oracle.ask_structured("TASK: ...", None).await;
//! ```

pub mod litellm;
pub mod oracle;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
    DEFAULT_MODEL,
};
pub use oracle::{CallOptions, OracleConfig, OracleError, ReasoningOracle};
