//! styleforge: restyles documents into themed HTML.
//!
//! Content flows through five LLM-backed stages (content analysis, style
//! analysis, design adaptation, code generation, quality assessment). A
//! quality gate sends design and generation back for another pass until the
//! result is good enough or the iteration cap is reached. Tasks and every
//! stage attempt are persisted in SQLite.

// Core modules
pub mod agents;
pub mod cli;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod storage;
pub mod utils;

// Re-export commonly used error types
pub use error::{LlmError, ValidationError};
