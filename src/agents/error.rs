//! Error types for pipeline stages.
//!
//! A stage never lets a fault escape as a panic or an untyped value: every
//! failure is one of these variants, which the collaboration wrapper turns
//! into a recorded issue and a failed execution record.

use thiserror::Error;

use crate::error::LlmError;
use crate::utils::JsonExtractionError;

/// Errors that can occur while running a single stage.
#[derive(Debug, Error)]
pub enum StageError {
    /// Inputs required by the stage are missing or unusable.
    #[error("Precondition failed for {stage}: {reason}")]
    Precondition { stage: String, reason: String },

    /// The stage ran but its output violates its own contract.
    #[error("Postcondition failed for {stage}: {reason}")]
    Postcondition { stage: String, reason: String },

    /// The generative capability failed after retries were exhausted.
    #[error("Generation failed: {0}")]
    Generation(#[from] LlmError),

    /// The LLM reply could not be turned into the stage's output type.
    #[error("Failed to parse LLM response: {0}")]
    ResponseParse(String),

    /// The offloaded unit of work panicked or was cancelled.
    #[error("Stage task aborted: {0}")]
    Panicked(String),
}

impl StageError {
    pub fn precondition(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        StageError::Precondition {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    pub fn postcondition(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        StageError::Postcondition {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-friendly label, used as a metrics/log field.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Precondition { .. } => "precondition",
            StageError::Postcondition { .. } => "postcondition",
            StageError::Generation(_) => "generation",
            StageError::ResponseParse(_) => "response_parse",
            StageError::Panicked(_) => "panicked",
        }
    }
}

impl From<JsonExtractionError> for StageError {
    fn from(err: JsonExtractionError) -> Self {
        StageError::ResponseParse(err.to_string())
    }
}
