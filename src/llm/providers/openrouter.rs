//! OpenRouter provider.
//!
//! OpenRouter exposes many upstream models behind one OpenAI-compatible
//! endpoint. This provider issues exactly one HTTP request per call; wrap it
//! in [`RetryingProvider`](crate::llm::RetryingProvider) for backoff.

use async_trait::async_trait;
use reqwest::Client;

use crate::error::LlmError;
use crate::llm::litellm::{build_http_client, post_chat_completion, ApiRequest};
use crate::llm::{GenerationRequest, GenerationResponse, LlmProvider};

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Model used when neither the CLI nor `STYLEFORGE_MODEL` picks one.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4.5";

/// Hosted OpenRouter backend. Requires a non-blank key.
pub struct OpenRouterProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl std::fmt::Debug for OpenRouterProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterProvider")
            .field("api_key", &self.api_key_masked())
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .finish_non_exhaustive()
    }
}

impl OpenRouterProvider {
    pub fn new(api_key: String) -> Result<Self, LlmError> {
        Self::with_model(api_key, DEFAULT_MODEL.to_string())
    }

    pub fn with_model(api_key: String, model: String) -> Result<Self, LlmError> {
        Self::with_custom_url(api_key, OPENROUTER_BASE_URL.to_string(), model)
    }

    /// Points the provider at a self-hosted mirror of the OpenRouter API.
    pub fn with_custom_url(
        api_key: String,
        base_url: String,
        model: String,
    ) -> Result<Self, LlmError> {
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        Ok(Self {
            client: build_http_client()?,
            api_key,
            base_url,
            default_model: model,
        })
    }

    /// Key with everything but the outer four characters hidden.
    pub fn api_key_masked(&self) -> String {
        let key = &self.api_key;
        match (key.get(..4), key.get(key.len().saturating_sub(4)..)) {
            (Some(head), Some(tail)) if key.len() > 8 => format!("{}...{}", head, tail),
            _ => "*".repeat(key.chars().count()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[async_trait]
impl LlmProvider for OpenRouterProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let body = ApiRequest::from_request(request, &self.default_model);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        tracing::debug!(model = %body.model, messages = body.messages.len(), "OpenRouter request");

        let http_request = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", "https://styleforge.local");

        post_chat_completion(http_request, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_hosted_endpoint() {
        let provider = OpenRouterProvider::new("test-api-key".to_string()).expect("builds");

        assert_eq!(provider.base_url(), OPENROUTER_BASE_URL);
        assert_eq!(provider.default_model(), DEFAULT_MODEL);
        assert_eq!(provider.api_key_masked(), "test...-key");
    }

    #[test]
    fn test_mirror_url_and_model_are_kept() {
        let provider = OpenRouterProvider::with_custom_url(
            "mirror-key".to_string(),
            "https://llm.internal.example/v1/".to_string(),
            "meta/llama-3".to_string(),
        )
        .expect("builds");

        assert_eq!(provider.base_url(), "https://llm.internal.example/v1/");
        assert_eq!(provider.default_model(), "meta/llama-3");
        assert_eq!(provider.api_key_masked(), "mirr...-key");
    }

    #[test]
    fn test_short_key_fully_masked() {
        let provider = OpenRouterProvider::new("abc".to_string()).expect("builds");
        assert_eq!(provider.api_key_masked(), "***");
    }

    #[test]
    fn test_empty_api_key_rejected() {
        let result = OpenRouterProvider::new("   ".to_string());
        assert!(matches!(result, Err(LlmError::MissingApiKey)));
    }
}
