//! Pipeline configuration for the orchestrator.
//!
//! Values come from defaults, an optional YAML file and `ARIA_*` environment
//! variables, in that order of increasing priority.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::memory::CompressorConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Storage
    /// Directory holding synthesized capability sources and their manifest.
    pub capability_dir: PathBuf,
    /// Directory rendered report files are written to.
    pub output_dir: PathBuf,
    /// Directory for file checkpoints.
    pub checkpoint_dir: PathBuf,
    /// SQLite URL; when set, checkpoints go to the database instead of files.
    pub checkpoint_database_url: Option<String>,
    /// Documents for the retrieval stage; `None` disables retrieval.
    pub knowledge_dir: Option<PathBuf>,

    // Oracle
    /// Model passed to the provider; empty uses the provider default.
    pub model: String,
    pub temperature: f64,
    #[serde(with = "duration_secs")]
    pub oracle_timeout: Duration,

    // Execution
    /// Bound on one extractor, operation or knowledge-base call.
    #[serde(with = "duration_secs")]
    pub stage_timeout: Duration,
    /// Bound on one synthesis run.
    #[serde(with = "duration_secs")]
    pub synthesis_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub sandbox_timeout: Duration,
    pub sandbox_interpreter: String,
    /// Stage executions per run before the run is forced to report.
    pub max_stage_visits: usize,
    /// Chunks retrieved per query.
    pub rag_top_k: usize,

    // Conversation memory
    pub memory_window_size: usize,
    pub memory_overlap: usize,
    pub memory_max_messages: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capability_dir: PathBuf::from("./capabilities"),
            output_dir: PathBuf::from("./reports"),
            checkpoint_dir: PathBuf::from("./checkpoints"),
            checkpoint_database_url: None,
            knowledge_dir: None,

            model: String::new(),
            temperature: 0.6,
            oracle_timeout: Duration::from_secs(120),

            stage_timeout: Duration::from_secs(60),
            synthesis_timeout: Duration::from_secs(600),
            sandbox_timeout: Duration::from_secs(10),
            sandbox_interpreter: "python3".to_string(),
            max_stage_visits: 64,
            rag_top_k: 3,

            memory_window_size: 10,
            memory_overlap: 2,
            memory_max_messages: 20,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ARIA_CAPABILITY_DIR`: synthesized capability directory (default: ./capabilities)
    /// - `ARIA_OUTPUT_DIR`: report output directory (default: ./reports)
    /// - `ARIA_CHECKPOINT_DIR`: checkpoint directory (default: ./checkpoints)
    /// - `ARIA_CHECKPOINT_DATABASE_URL`: SQLite URL for checkpoints
    /// - `ARIA_KNOWLEDGE_DIR`: knowledge base documents
    /// - `ARIA_MODEL`: model override
    /// - `ARIA_TEMPERATURE`: oracle temperature (default: 0.6)
    /// - `ARIA_ORACLE_TIMEOUT_SECS`: oracle call timeout (default: 120)
    /// - `ARIA_STAGE_TIMEOUT_SECS`: capability call timeout (default: 60)
    /// - `ARIA_SYNTHESIS_TIMEOUT_SECS`: synthesis run timeout (default: 600)
    /// - `ARIA_SANDBOX_TIMEOUT_SECS`: sandbox timeout (default: 10)
    /// - `ARIA_SANDBOX_INTERPRETER`: sandbox interpreter (default: python3)
    /// - `ARIA_MAX_STAGE_VISITS`: stage execution guard (default: 64)
    /// - `ARIA_RAG_TOP_K`: chunks per retrieval query (default: 3)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file, then apply environment overrides.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&text)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("ARIA_CAPABILITY_DIR") {
            self.capability_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ARIA_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ARIA_CHECKPOINT_DIR") {
            self.checkpoint_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ARIA_CHECKPOINT_DATABASE_URL") {
            self.checkpoint_database_url = Some(val).filter(|v| !v.is_empty());
        }

        if let Ok(val) = std::env::var("ARIA_KNOWLEDGE_DIR") {
            self.knowledge_dir = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("ARIA_MODEL") {
            self.model = val;
        }

        if let Ok(val) = std::env::var("ARIA_TEMPERATURE") {
            self.temperature = parse_env_value(&val, "ARIA_TEMPERATURE")?;
        }

        if let Ok(val) = std::env::var("ARIA_ORACLE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "ARIA_ORACLE_TIMEOUT_SECS")?;
            self.oracle_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("ARIA_STAGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "ARIA_STAGE_TIMEOUT_SECS")?;
            self.stage_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("ARIA_SYNTHESIS_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "ARIA_SYNTHESIS_TIMEOUT_SECS")?;
            self.synthesis_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("ARIA_SANDBOX_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "ARIA_SANDBOX_TIMEOUT_SECS")?;
            self.sandbox_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("ARIA_SANDBOX_INTERPRETER") {
            self.sandbox_interpreter = val;
        }

        if let Ok(val) = std::env::var("ARIA_MAX_STAGE_VISITS") {
            self.max_stage_visits = parse_env_value(&val, "ARIA_MAX_STAGE_VISITS")?;
        }

        if let Ok(val) = std::env::var("ARIA_RAG_TOP_K") {
            self.rag_top_k = parse_env_value(&val, "ARIA_RAG_TOP_K")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        for (name, timeout) in [
            ("oracle_timeout", self.oracle_timeout),
            ("stage_timeout", self.stage_timeout),
            ("synthesis_timeout", self.synthesis_timeout),
            ("sandbox_timeout", self.sandbox_timeout),
        ] {
            if timeout.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.sandbox_interpreter.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "sandbox_interpreter cannot be empty".to_string(),
            ));
        }

        // one full pass through the graph is eleven visits at most
        if self.max_stage_visits < 11 {
            return Err(ConfigError::ValidationFailed(
                "max_stage_visits must be at least 11".to_string(),
            ));
        }

        if self.rag_top_k == 0 {
            return Err(ConfigError::ValidationFailed(
                "rag_top_k must be greater than 0".to_string(),
            ));
        }

        self.compressor_config()
            .validate()
            .map_err(ConfigError::ValidationFailed)?;

        Ok(())
    }

    /// Window settings for the conversation compressor.
    pub fn compressor_config(&self) -> CompressorConfig {
        CompressorConfig {
            window_size: self.memory_window_size,
            overlap: self.memory_overlap,
            max_messages: self.memory_max_messages,
            ..CompressorConfig::default()
        }
    }

    pub fn with_capability_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.capability_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    pub fn with_checkpoint_database_url(mut self, url: impl Into<String>) -> Self {
        self.checkpoint_database_url = Some(url.into());
        self
    }

    pub fn with_knowledge_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.knowledge_dir = Some(dir.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_oracle_timeout(mut self, timeout: Duration) -> Self {
        self.oracle_timeout = timeout;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_synthesis_timeout(mut self, timeout: Duration) -> Self {
        self.synthesis_timeout = timeout;
        self
    }

    pub fn with_sandbox_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox_timeout = timeout;
        self
    }

    pub fn with_max_stage_visits(mut self, max: usize) -> Self {
        self.max_stage_visits = max;
        self
    }

    pub fn with_rag_top_k(mut self, top_k: usize) -> Self {
        self.rag_top_k = top_k;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Durations are written as whole seconds in YAML.
mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
