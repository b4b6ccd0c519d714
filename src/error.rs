//! Error types shared across styleforge subsystems.
//!
//! Subsystem-specific errors live next to their modules
//! (`storage::DatabaseError`, `agents::StageError`, `pipeline::EngineError`).
//! This module holds the ones that cross module boundaries:
//! - Request validation, rejected before any task is created
//! - LLM API interactions, split into transient and hard failures

use thiserror::Error;

/// Errors raised when a transformation request is malformed.
///
/// These are always reported before a task row exists.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Content must not be empty")]
    EmptyContent,

    #[error("Style name must not be empty")]
    EmptyStyleName,

    #[error("Style feature at position {index} is empty")]
    EmptyStyleFeature { index: usize },

    #[error("Content is too large: {size} bytes exceeds limit of {limit} bytes")]
    ContentTooLarge { size: usize, limit: usize },
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: OPENROUTER_API_KEY or LITELLM_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),
}

impl LlmError {
    /// Returns true when the failure is worth retrying.
    ///
    /// Timeouts, dropped connections, rate limits and 5xx responses are
    /// transient; everything else fails immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout(_) | LlmError::RateLimited(_) => true,
            LlmError::RequestFailed(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("connection")
                    || msg.contains("temporarily")
            }
            LlmError::ApiError { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else {
            LlmError::RequestFailed(err.to_string())
        }
    }
}
