//! Error types for aria-forge operations.
//!
//! Defines the error types shared across subsystems:
//! - LLM API interactions
//! - Capability registry bookkeeping
//! - Capability invocation (extractors, operations, synthesized scripts)
//! - Report rendering
//!
//! Pipeline, synthesis, checkpoint and configuration errors live next to the
//! code that raises them.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Gateway rejected the credentials: {0}")]
    Unauthorized(String),

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during capability registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Capability '{0}' not found in registry")]
    CapabilityNotFound(String),

    #[error("Invalid capability name '{0}': must be non-empty snake_case")]
    InvalidName(String),

    #[error("Manifest entry '{name}' is invalid: {reason}")]
    InvalidManifestEntry { name: String, reason: String },

    #[error("Source hash mismatch for '{name}': manifest says {expected}, file hashes to {actual}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while invoking a capability.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// The resource the capability was pointed at does not exist.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported format '{0}'")]
    UnsupportedFormat(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    /// The capability ran and answered with an `{"error": ...}` object.
    #[error("Capability reported: {0}")]
    Reported(String),

    #[error("Capability timed out after {0:?}")]
    Timeout(Duration),

    #[error("Output violates the capability contract: {0}")]
    ContractViolation(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for CapabilityError {
    fn from(err: reqwest::Error) -> Self {
        CapabilityError::Http(err.to_string())
    }
}

/// Errors that can occur while rendering a report.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("No renderer registered for format '{0}'")]
    UnknownFormat(String),

    #[error("Template rendering error: {0}")]
    Template(#[from] tera::Error),

    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_error_display() {
        let err = CapabilityError::ResourceNotFound("/data/missing.csv".to_string());
        assert_eq!(err.to_string(), "Resource not found: /data/missing.csv");

        let err = CapabilityError::UnsupportedFormat("xml".to_string());
        assert_eq!(err.to_string(), "Unsupported format 'xml'");
    }

    #[test]
    fn test_registry_hash_mismatch_display() {
        let err = RegistryError::HashMismatch {
            name: "extract_xml".to_string(),
            expected: "abc".to_string(),
            actual: "def".to_string(),
        };
        assert!(err.to_string().contains("extract_xml"));
        assert!(err.to_string().contains("abc"));
    }
}
