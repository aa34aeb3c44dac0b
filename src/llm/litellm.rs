//! LiteLLM-compatible client implementation for aria-forge.
//!
//! The pipeline only needs one request/response shape: a list of chat
//! messages in, the first completion out. Any OpenAI-compatible gateway
//! (LiteLLM proxy, OpenRouter) speaks it.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::LlmError;

/// Default model used when neither the request nor the environment names one.
pub const DEFAULT_MODEL: &str = "anthropic/claude-opus-4.5";

const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

/// A chat message exchanged with the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// "system", "user" or "assistant".
    pub role: String,
    pub content: String,
}

impl Message {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }
}

/// One chat completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Model identifier. Empty means "use the client's default".
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Ask the gateway to constrain the reply to a JSON object.
    #[serde(default)]
    pub json_mode: bool,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            json_mode: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
        self
    }
}

/// Completion returned by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl GenerationResponse {
    /// Text of the first choice, if the provider returned any.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Transport seam for chat completions. Tests substitute scripted providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;
}

/// Client for OpenAI-compatible gateways (LiteLLM proxy, OpenRouter).
pub struct LiteLlmClient {
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    request_timeout: Duration,
    http_client: Client,
}

impl LiteLlmClient {
    /// `api_base` is the gateway root, e.g. "http://localhost:4000".
    pub fn new(api_base: String, api_key: Option<String>, default_model: String) -> Self {
        let request_timeout = Duration::from_secs(120);
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            default_model,
            request_timeout,
            http_client: build_http_client(request_timeout),
        }
    }

    pub fn openrouter(api_key: String, model: impl Into<String>) -> Self {
        Self::new(OPENROUTER_API_BASE.to_string(), Some(api_key), model.into())
    }

    /// Build a client from `LITELLM_API_BASE` (required), `LITELLM_API_KEY`
    /// and `LITELLM_DEFAULT_MODEL`.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_base = env::var("LITELLM_API_BASE").map_err(|_| LlmError::MissingApiBase)?;
        let api_key = env::var("LITELLM_API_KEY").ok();
        let default_model =
            env::var("LITELLM_DEFAULT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Ok(Self::new(api_base, api_key, default_model))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self.http_client = build_http_client(timeout);
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn wire_request<'a>(&'a self, request: &'a GenerationRequest) -> WireRequest<'a> {
        let model = if request.model.is_empty() {
            self.default_model.as_str()
        } else {
            request.model.as_str()
        };
        WireRequest {
            model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json_mode.then_some(ResponseFormat { kind: "json_object" }),
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout(self.request_timeout)
        } else {
            LlmError::RequestFailed(e.to_string())
        }
    }
}

fn build_http_client(timeout: Duration) -> Client {
    // Builder only fails when the TLS backend cannot initialise; the default
    // client then surfaces the same problem on first request.
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    index: u32,
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    message: String,
}

impl From<WireResponse> for GenerationResponse {
    fn from(wire: WireResponse) -> Self {
        let choices = wire
            .choices
            .into_iter()
            .map(|choice| Choice {
                index: choice.index,
                message: Message {
                    role: choice.message.role,
                    content: choice.message.content.unwrap_or_default(),
                },
                finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            })
            .collect();

        Self {
            id: wire.id,
            model: wire.model,
            choices,
            usage: wire.usage.unwrap_or_default(),
        }
    }
}

/// Map a non-success status and its body onto an [`LlmError`].
fn status_error(status_code: u16, body: String) -> LlmError {
    let message = serde_json::from_str::<WireError>(&body)
        .map(|parsed| parsed.error.message)
        .unwrap_or(body);

    match status_code {
        401 | 403 => LlmError::Unauthorized(message),
        429 => LlmError::RateLimited(message),
        code => LlmError::ApiError { code, message },
    }
}

#[async_trait]
impl LlmProvider for LiteLlmClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let mut http_request = self
            .http_client
            .post(self.completions_url())
            .header("X-Title", "aria-forge")
            .json(&self.wire_request(&request));

        if let Some(ref api_key) = self.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let http_response = http_request.send().await.map_err(|e| self.transport_error(e))?;

        let status = http_response.status();
        if !status.is_success() {
            let body = http_response.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), "Gateway rejected completion request");
            return Err(status_error(status.as_u16(), body));
        }

        let wire: WireResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;

        Ok(wire.into())
    }
}
