//! LLM integration for styleforge.
//!
//! Every pipeline stage receives an `Arc<dyn LlmProvider>`. The concrete
//! provider is built once at startup and wrapped in a [`RetryingProvider`]
//! so transient failures are retried with exponential backoff before a
//! stage ever sees them.
//!
//! ```ignore
//! use styleforge::llm::{OpenRouterProvider, RetryingProvider, RetryPolicy};
//! use std::sync::Arc;
//!
//! let provider = Arc::new(OpenRouterProvider::new(api_key)?);
//! let llm = Arc::new(RetryingProvider::new(provider, RetryPolicy::default()));
//! ```

pub mod litellm;
pub mod providers;
pub mod retry;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
};
pub use providers::OpenRouterProvider;
pub use retry::{RetryPolicy, RetryingProvider};
