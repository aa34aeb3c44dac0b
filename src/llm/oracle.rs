//! Reasoning oracle: the request/response seam between pipeline stages and the LLM.
//!
//! Stages ask either for free text or for a parsed JSON object. A reply that
//! cannot be parsed is reported as [`OracleError::Malformed`], which callers
//! treat as recoverable: they fall back to a safe default or record an error
//! and keep going.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::litellm::{GenerationRequest, LlmProvider, Message};
use crate::error::LlmError;
use crate::metrics::MetricsCollector;
use crate::prompts::ARIA_SYSTEM_PROMPT;
use crate::utils::json_extraction::{extract_json_object, JsonExtractionError};

/// Errors returned by [`ReasoningOracle`] calls.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("oracle returned an empty response")]
    Empty,

    #[error("oracle returned malformed output: {0}")]
    Malformed(#[from] JsonExtractionError),
}

impl OracleError {
    /// Whether the oracle answered but the answer could not be used.
    pub fn is_malformed(&self) -> bool {
        matches!(self, OracleError::Malformed(_) | OracleError::Empty)
    }
}

/// Sampling and timeout settings for oracle calls.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// Model identifier passed through to the provider. Empty uses the provider default.
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Upper bound on a single call, including network time.
    pub timeout: Duration,
    pub system_prompt: String,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.6,
            max_tokens: 4096,
            timeout: Duration::from_secs(120),
            system_prompt: ARIA_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl OracleConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }
}

/// Per-call overrides for sampling parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Request a JSON object reply from the gateway.
    pub json: bool,
}

/// LLM wrapper used by every oracle-calling stage.
#[derive(Clone)]
pub struct ReasoningOracle {
    provider: Arc<dyn LlmProvider>,
    config: OracleConfig,
    metrics: MetricsCollector,
}

impl ReasoningOracle {
    /// Create an oracle over the given provider.
    pub fn new(provider: Arc<dyn LlmProvider>, config: OracleConfig) -> Self {
        Self {
            provider,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// Create an oracle with default settings.
    pub fn with_defaults(provider: Arc<dyn LlmProvider>) -> Self {
        Self::new(provider, OracleConfig::default())
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// A copy of this oracle that sends a different system prompt.
    pub fn with_system_prompt(&self, system_prompt: impl Into<String>) -> Self {
        let mut oracle = self.clone();
        oracle.config.system_prompt = system_prompt.into();
        oracle
    }

    /// Ask for free text.
    pub async fn ask_text(&self, prompt: &str, context: Option<&str>) -> Result<String, OracleError> {
        self.ask_text_with(prompt, context, CallOptions::default()).await
    }

    /// Ask for free text with per-call sampling overrides.
    pub async fn ask_text_with(
        &self,
        prompt: &str,
        context: Option<&str>,
        options: CallOptions,
    ) -> Result<String, OracleError> {
        let request = self.build_request(prompt, context, options);
        let model_label = if self.config.model.is_empty() {
            "default"
        } else {
            self.config.model.as_str()
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.timeout, self.provider.generate(request)).await;
        let elapsed = started.elapsed().as_secs_f64();

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.metrics.record_oracle_call(model_label, "error", elapsed);
                tracing::warn!(error = %e, "Oracle call failed");
                return Err(e.into());
            }
            Err(_) => {
                self.metrics.record_oracle_call(model_label, "timeout", elapsed);
                tracing::warn!(timeout = ?self.config.timeout, "Oracle call timed out");
                return Err(LlmError::Timeout(self.config.timeout).into());
            }
        };

        let content = response.first_content().unwrap_or_default().trim().to_string();
        if content.is_empty() {
            self.metrics.record_oracle_call(model_label, "empty", elapsed);
            return Err(OracleError::Empty);
        }

        self.metrics.record_oracle_call(model_label, "ok", elapsed);
        tracing::debug!(
            latency_secs = elapsed,
            response_chars = content.len(),
            "Oracle call completed"
        );
        Ok(content)
    }

    /// Ask for a JSON object, reporting why the reply was unusable on failure.
    pub async fn ask_json(
        &self,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<(Map<String, Value>, String), OracleError> {
        let options = CallOptions {
            json: true,
            ..CallOptions::default()
        };
        let raw = self.ask_text_with(prompt, context, options).await?;
        match extract_json_object(&raw) {
            Ok(object) => Ok((object, raw)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    preview = %crate::utils::truncate_chars(&raw, 300),
                    "Oracle returned malformed JSON"
                );
                Err(OracleError::Malformed(e))
            }
        }
    }

    /// Ask for a structured object; `None` when the call fails or the reply is malformed.
    pub async fn ask_structured(&self, prompt: &str, context: Option<&str>) -> Option<Value> {
        self.ask_json(prompt, context)
            .await
            .ok()
            .map(|(object, _)| Value::Object(object))
    }

    fn build_request(
        &self,
        prompt: &str,
        context: Option<&str>,
        options: CallOptions,
    ) -> GenerationRequest {
        let mut messages = Vec::with_capacity(2);
        if !self.config.system_prompt.is_empty() {
            messages.push(Message::system(self.config.system_prompt.clone()));
        }
        let user = match context {
            Some(ctx) if !ctx.trim().is_empty() => format!("# CONTEXT\n{}\n\n{}", ctx, prompt),
            _ => prompt.to_string(),
        };
        messages.push(Message::user(user));

        GenerationRequest::new(self.config.model.clone(), messages)
            .with_temperature(options.temperature.unwrap_or(self.config.temperature))
            .with_max_tokens(options.max_tokens.unwrap_or(self.config.max_tokens))
            .with_json_mode(options.json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Choice, GenerationResponse, Usage};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Mock provider that echoes fixed content and records requests.
    struct MockLlmProvider {
        content: String,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl MockLlmProvider {
        fn new(content: &str) -> Self {
            Self {
                content: content.to_string(),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlmProvider {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            self.requests.lock().expect("lock not poisoned").push(request);
            Ok(GenerationResponse {
                id: "mock".to_string(),
                model: "mock-model".to_string(),
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(self.content.clone()),
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage::default(),
            })
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl LlmProvider for SlowProvider {
        async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(LlmError::RequestFailed("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_ask_structured_strips_fences() {
        let provider = Arc::new(MockLlmProvider::new("```json\n{\"domain\": \"retail\"}\n```"));
        let oracle = ReasoningOracle::with_defaults(provider);

        let value = oracle.ask_structured("classify", None).await.expect("should parse");
        assert_eq!(value["domain"], "retail");
    }

    #[tokio::test]
    async fn test_ask_structured_absent_on_malformed() {
        let provider = Arc::new(MockLlmProvider::new("I am not sure."));
        let oracle = ReasoningOracle::with_defaults(provider);

        assert!(oracle.ask_structured("classify", None).await.is_none());
        let err = oracle.ask_json("classify", None).await.unwrap_err();
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn test_context_is_prefixed() {
        let provider = Arc::new(MockLlmProvider::new("{}"));
        let oracle = ReasoningOracle::with_defaults(provider.clone());

        oracle.ask_text("do it", Some("earlier turns")).await.expect("ok");

        let requests = provider.requests.lock().expect("lock not poisoned");
        let user = &requests[0].messages.last().expect("user message").content;
        assert!(user.starts_with("# CONTEXT\nearlier turns\n\ndo it"));
        assert_eq!(requests[0].messages[0].role, "system");
    }

    #[tokio::test]
    async fn test_call_options_override_sampling() {
        let provider = Arc::new(MockLlmProvider::new("{\"summary\": 1}"));
        let oracle = ReasoningOracle::with_defaults(provider.clone());

        let options = CallOptions {
            temperature: Some(0.2),
            max_tokens: Some(1024),
            ..CallOptions::default()
        };
        oracle.ask_text_with("sum up", None, options).await.expect("ok");
        oracle.ask_json("classify", None).await.expect("ok");

        let requests = provider.requests.lock().expect("lock not poisoned");
        assert_eq!(requests[0].temperature, Some(0.2));
        assert_eq!(requests[0].max_tokens, Some(1024));
        assert!(!requests[0].json_mode);
        assert!(requests[1].json_mode);
    }

    #[tokio::test]
    async fn test_timeout_is_enforced() {
        let oracle = ReasoningOracle::new(
            Arc::new(SlowProvider),
            OracleConfig::default().with_timeout(Duration::from_millis(20)),
        );

        let err = oracle.ask_text("anything", None).await.unwrap_err();
        assert!(matches!(err, OracleError::Llm(LlmError::Timeout(_))));
        assert!(!err.is_malformed());
    }
}
