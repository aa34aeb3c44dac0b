//! Rolling-window conversation compressor.
//!
//! Once the conversation exceeds `max_messages` turns, everything except the
//! last `window_size` turns (plus `overlap` turns of shared context) is folded
//! into a running summary by the oracle. The previous summary is part of the
//! summarization input and the result is capped at `max_summary_chars`, so
//! repeated compression keeps both the window and the summary bounded.

use serde::{Deserialize, Serialize};

use crate::llm::{CallOptions, ReasoningOracle};
use crate::prompts::build_summary_prompt;
use crate::utils::truncate_chars;

/// Header placed in front of the running summary when it is handed to the oracle.
pub const PREVIOUS_CONTEXT_HEADER: &str = "[PREVIOUS CONTEXT]";

const FALLBACK_TURN_CHARS: usize = 200;

/// One oracle exchange turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    fn render(&self, max_chars: usize) -> String {
        format!(
            "[{}]: {}",
            self.role.to_uppercase(),
            truncate_chars(&self.content, max_chars)
        )
    }
}

/// Conversation history carried in the pipeline state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMemory {
    /// Recent turns, oldest first.
    pub turns: Vec<Turn>,
    /// Running summary of everything compressed so far.
    pub summary: Option<String>,
    /// Number of compressions applied.
    pub compressions: u32,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one prompt/response exchange.
    pub fn record_exchange(&mut self, prompt: impl Into<String>, response: impl Into<String>) {
        self.turns.push(Turn::user(prompt));
        self.turns.push(Turn::assistant(response));
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.summary.is_none()
    }
}

/// Window settings for [`ContextCompressor`].
#[derive(Debug, Clone)]
pub struct CompressorConfig {
    /// Turns kept verbatim after a compression.
    pub window_size: usize,
    /// Turns that are both summarized and kept in the window.
    pub overlap: usize,
    /// Compression triggers when the turn count exceeds this.
    pub max_messages: usize,
    /// Characters kept per turn when rendering turns for the oracle.
    pub turn_preview_chars: usize,
    /// Hard cap on the running summary length.
    pub max_summary_chars: usize,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            overlap: 2,
            max_messages: 20,
            turn_preview_chars: 500,
            max_summary_chars: 4000,
            temperature: 0.2,
            max_tokens: 1024,
        }
    }
}

impl CompressorConfig {
    /// Check the window settings are coherent.
    pub fn validate(&self) -> Result<(), String> {
        if self.window_size == 0 {
            return Err("window_size must be greater than 0".to_string());
        }
        if self.overlap >= self.window_size {
            return Err("overlap must be smaller than window_size".to_string());
        }
        if self.max_messages < self.window_size {
            return Err("max_messages must be at least window_size".to_string());
        }
        if self.max_summary_chars == 0 {
            return Err("max_summary_chars must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// What a call to [`ContextCompressor::compress`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionOutcome {
    /// History was under the threshold.
    NotNeeded,
    /// Older turns were summarized by the oracle.
    Summarized { compressed_turns: usize },
    /// The oracle failed; older turns were condensed deterministically.
    Condensed { compressed_turns: usize },
}

/// Bounds the conversational history handed to the oracle.
#[derive(Clone)]
pub struct ContextCompressor {
    oracle: ReasoningOracle,
    config: CompressorConfig,
}

impl ContextCompressor {
    pub fn new(oracle: ReasoningOracle, config: CompressorConfig) -> Self {
        Self { oracle, config }
    }

    pub fn config(&self) -> &CompressorConfig {
        &self.config
    }

    /// Compress `memory` in place if it exceeds the threshold.
    pub async fn compress(&self, memory: &mut ConversationMemory) -> CompressionOutcome {
        let total = memory.turns.len();
        if total <= self.config.max_messages {
            return CompressionOutcome::NotNeeded;
        }

        let cut = (total - self.config.window_size + self.config.overlap).min(total);
        let rendered = memory.turns[..cut]
            .iter()
            .map(|turn| turn.render(self.config.turn_preview_chars))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = build_summary_prompt(
            memory.summary.as_deref(),
            &rendered,
            self.config.max_summary_chars,
        );
        let options = CallOptions {
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            json: false,
        };

        let outcome = match self.oracle.ask_text_with(&prompt, None, options).await {
            Ok(summary) => {
                memory.summary = Some(truncate_chars(&summary, self.config.max_summary_chars).to_string());
                CompressionOutcome::Summarized { compressed_turns: cut }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Summarization failed, condensing history without the oracle");
                memory.summary = Some(self.condense(memory.summary.as_deref(), &memory.turns[..cut]));
                CompressionOutcome::Condensed { compressed_turns: cut }
            }
        };

        memory.turns.drain(..total - self.config.window_size);
        memory.compressions += 1;

        tracing::debug!(
            compressed_turns = cut,
            kept_turns = memory.turns.len(),
            compressions = memory.compressions,
            "Conversation compressed"
        );
        outcome
    }

    /// Render the summary and recent window as an oracle context string.
    pub fn render_context(&self, memory: &ConversationMemory) -> Option<String> {
        if memory.is_empty() {
            return None;
        }

        let mut sections = Vec::new();
        if let Some(summary) = &memory.summary {
            sections.push(format!("{}\n{}", PREVIOUS_CONTEXT_HEADER, summary));
        }
        if !memory.turns.is_empty() {
            let recent = memory
                .turns
                .iter()
                .map(|turn| turn.render(self.config.turn_preview_chars))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("[RECENT TURNS]\n{}", recent));
        }
        Some(sections.join("\n\n"))
    }

    /// Compress if needed, then render the context string.
    pub async fn context_for(&self, memory: &mut ConversationMemory) -> Option<String> {
        self.compress(memory).await;
        self.render_context(memory)
    }

    /// Deterministic condensation used when the oracle cannot summarize.
    /// Keeps the newest material when the cap is hit.
    fn condense(&self, previous: Option<&str>, turns: &[Turn]) -> String {
        let mut lines: Vec<String> = previous.map(|s| vec![s.to_string()]).unwrap_or_default();
        lines.extend(turns.iter().map(|turn| turn.render(FALLBACK_TURN_CHARS)));
        let combined = lines.join("\n");

        let len = combined.chars().count();
        if len <= self.config.max_summary_chars {
            combined
        } else {
            combined.chars().skip(len - self.config.max_summary_chars).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Mock provider returning a fixed summary and recording prompts.
    struct MockLlmProvider {
        reply: Result<String, ()>,
        prompts: Mutex<Vec<String>>,
    }

    impl MockLlmProvider {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err(()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlmProvider {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            let prompt = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            self.prompts.lock().expect("lock not poisoned").push(prompt);
            match &self.reply {
                Ok(content) => Ok(GenerationResponse {
                    id: "mock".to_string(),
                    model: "mock".to_string(),
                    choices: vec![Choice {
                        index: 0,
                        message: Message::assistant(content.clone()),
                        finish_reason: "stop".to_string(),
                    }],
                    usage: Usage::default(),
                }),
                Err(()) => Err(LlmError::RequestFailed("offline".to_string())),
            }
        }
    }

    fn compressor(provider: Arc<MockLlmProvider>) -> ContextCompressor {
        ContextCompressor::new(ReasoningOracle::with_defaults(provider), CompressorConfig::default())
    }

    fn memory_with(turns: usize) -> ConversationMemory {
        let mut memory = ConversationMemory::new();
        for i in 0..turns {
            memory.turns.push(Turn::user(format!("turn {}", i)));
        }
        memory
    }

    #[tokio::test]
    async fn test_no_compression_under_threshold() {
        let provider = Arc::new(MockLlmProvider::replying("unused"));
        let compressor = compressor(provider.clone());
        let mut memory = memory_with(20);

        let outcome = compressor.compress(&mut memory).await;

        assert_eq!(outcome, CompressionOutcome::NotNeeded);
        assert_eq!(memory.turns.len(), 20);
        assert!(provider.prompts.lock().expect("lock not poisoned").is_empty());
    }

    #[tokio::test]
    async fn test_compression_keeps_window_and_overlap() {
        let provider = Arc::new(MockLlmProvider::replying("the summary"));
        let compressor = compressor(provider.clone());
        let mut memory = memory_with(21);

        let outcome = compressor.compress(&mut memory).await;

        // 21 - 10 + 2 = 13 turns summarized; turns 11 and 12 are also kept.
        assert_eq!(outcome, CompressionOutcome::Summarized { compressed_turns: 13 });
        assert_eq!(memory.turns.len(), 10);
        assert_eq!(memory.turns[0].content, "turn 11");
        assert_eq!(memory.summary.as_deref(), Some("the summary"));

        let prompts = provider.prompts.lock().expect("lock not poisoned");
        assert!(prompts[0].contains("[USER]: turn 12"));
        assert!(!prompts[0].contains("[USER]: turn 13"));
    }

    #[tokio::test]
    async fn test_second_compression_folds_existing_summary() {
        let provider = Arc::new(MockLlmProvider::replying("rolled summary"));
        let compressor = compressor(provider.clone());
        let mut memory = memory_with(21);
        compressor.compress(&mut memory).await;

        for i in 0..11 {
            memory.turns.push(Turn::assistant(format!("late {}", i)));
        }
        compressor.compress(&mut memory).await;

        assert_eq!(memory.compressions, 2);
        assert_eq!(memory.turns.len(), 10);
        let prompts = provider.prompts.lock().expect("lock not poisoned");
        assert!(prompts[1].contains("Existing summary:\nrolled summary"));
    }

    #[tokio::test]
    async fn test_summary_is_capped() {
        let provider = Arc::new(MockLlmProvider::replying(&"s".repeat(10_000)));
        let compressor = compressor(provider);
        let mut memory = memory_with(25);

        compressor.compress(&mut memory).await;

        assert_eq!(memory.summary.as_ref().map(|s| s.chars().count()), Some(4000));
    }

    #[tokio::test]
    async fn test_oracle_failure_condenses_deterministically() {
        let provider = Arc::new(MockLlmProvider::failing());
        let compressor = compressor(provider);
        let mut memory = memory_with(21);

        let outcome = compressor.compress(&mut memory).await;

        assert_eq!(outcome, CompressionOutcome::Condensed { compressed_turns: 13 });
        let summary = memory.summary.expect("fallback summary");
        assert!(summary.starts_with("[USER]: turn 0"));
        assert_eq!(memory.turns.len(), 10);
    }

    #[tokio::test]
    async fn test_render_context() {
        let provider = Arc::new(MockLlmProvider::replying("unused"));
        let compressor = compressor(provider);

        let empty = ConversationMemory::new();
        assert!(compressor.render_context(&empty).is_none());

        let mut memory = ConversationMemory::new();
        memory.summary = Some("domain: retail".to_string());
        memory.record_exchange("question", "answer");
        let context = compressor.render_context(&memory).expect("context");
        assert!(context.starts_with("[PREVIOUS CONTEXT]\ndomain: retail"));
        assert!(context.contains("[USER]: question"));
        assert!(context.contains("[ASSISTANT]: answer"));
    }

    #[test]
    fn test_config_validation() {
        assert!(CompressorConfig::default().validate().is_ok());

        let bad = CompressorConfig {
            overlap: 10,
            ..CompressorConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
