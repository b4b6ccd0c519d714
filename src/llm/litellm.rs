//! LiteLLM-compatible client and the provider trait every stage talks to.
//!
//! Stages only ever see `Arc<dyn LlmProvider>`; the concrete client is chosen
//! by the CLI at startup and wrapped in a [`RetryingProvider`](super::RetryingProvider).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::LlmError;

/// Default request timeout for LLM HTTP calls.
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 120;

/// One chat turn sent to or received from the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// `system`, `user` or `assistant`.
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

    /// Instructions that frame a stage's task.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    /// The stage's prompt.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }
}

/// A chat completion request as built by the stages.
///
/// Leave `model` empty to fall back to the provider's configured model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Completion cap; the provider default applies when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    /// Builds a request with provider-default sampling.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
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
}

/// What came back from the completion endpoint, normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub id: String,
    /// The model the provider actually routed to.
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl GenerationResponse {
    /// Text of the first choice. Stages never request more than one.
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .map(|choice| choice.message.content.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: String,
}

/// Token accounting reported by the provider; zeroed when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The seam between the stages and a chat completion backend.
///
/// Implementations may fail with a transient error (see
/// [`LlmError::is_transient`]). Retrying is the caller's concern.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;
}

/// Talks to a LiteLLM proxy, or any server exposing `/chat/completions`.
pub struct LiteLlmClient {
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    http_client: Client,
}

impl std::fmt::Debug for LiteLlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiteLlmClient")
            .field("api_base", &self.api_base)
            .field("default_model", &self.default_model)
            .field("has_api_key", &self.api_key.is_some())
            .finish_non_exhaustive()
    }
}

impl LiteLlmClient {
    /// `api_base` is the proxy root, without the `/chat/completions` suffix.
    /// The key is sent as a bearer token when present.
    pub fn new(
        api_base: String,
        api_key: Option<String>,
        default_model: String,
    ) -> Result<Self, LlmError> {
        Ok(Self {
            api_base,
            api_key,
            default_model,
            http_client: build_http_client()?,
        })
    }

    /// Reads `LITELLM_API_BASE` (required), `LITELLM_API_KEY` and
    /// `LITELLM_DEFAULT_MODEL`.
    pub fn from_env() -> Result<Self, LlmError> {
        let Ok(api_base) = env::var("LITELLM_API_BASE") else {
            return Err(LlmError::MissingApiBase);
        };
        let model = env::var("LITELLM_DEFAULT_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());
        Self::new(api_base, env::var("LITELLM_API_KEY").ok(), model)
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
}

pub(crate) fn build_http_client() -> Result<Client, LlmError> {
    Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|e| LlmError::ClientBuild(e.to_string()))
}

/// Request body for OpenAI-compatible chat completion endpoints.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ApiRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ApiRequest {
    pub(crate) fn from_request(request: GenerationRequest, default_model: &str) -> Self {
        let model = if request.model.is_empty() {
            default_model.to_string()
        } else {
            request.model
        };
        Self {
            model,
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse {
    id: String,
    model: String,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiChoice {
    index: u32,
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl From<ApiChoice> for Choice {
    fn from(raw: ApiChoice) -> Self {
        Choice {
            index: raw.index,
            message: Message {
                role: raw.message.role,
                content: raw.message.content.unwrap_or_default(),
            },
            finish_reason: raw.finish_reason.unwrap_or_else(|| "stop".to_string()),
        }
    }
}

impl From<ApiResponse> for GenerationResponse {
    fn from(api: ApiResponse) -> Self {
        let ApiResponse {
            id,
            model,
            choices,
            usage,
        } = api;
        GenerationResponse {
            id,
            model,
            choices: choices.into_iter().map(Choice::from).collect(),
            usage: usage.unwrap_or_default(),
        }
    }
}

/// Sends a chat completion request and maps HTTP failures onto [`LlmError`].
///
/// Shared by every OpenAI-compatible client in this crate. No retries here.
pub(crate) async fn post_chat_completion(
    http_request: reqwest::RequestBuilder,
    body: &ApiRequest,
) -> Result<GenerationResponse, LlmError> {
    let http_response = http_request
        .header("Content-Type", "application/json")
        .header("X-Title", "styleforge")
        .json(body)
        .send()
        .await?;

    let status = http_response.status();

    if !status.is_success() {
        let status_code = status.as_u16();
        let error_text = http_response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());

        let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
            .map(|parsed| parsed.error.message)
            .unwrap_or(error_text);

        if status_code == 429 {
            return Err(LlmError::RateLimited(message));
        }
        return Err(LlmError::ApiError {
            code: status_code,
            message,
        });
    }

    let api_response: ApiResponse = http_response
        .json()
        .await
        .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;

    Ok(api_response.into())
}

#[async_trait]
impl LlmProvider for LiteLlmClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let body = ApiRequest::from_request(request, &self.default_model);
        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));

        let http_request = match self.api_key.as_deref() {
            Some(key) => self.http_client.post(&url).bearer_auth(key),
            None => self.http_client.post(&url),
        };
        post_chat_completion(http_request, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_are_wire_strings() {
        let roles: Vec<_> = [
            Message::system("frame"),
            Message::user("prompt"),
            Message::assistant("reply"),
        ]
        .into_iter()
        .map(|m| m.role)
        .collect();
        assert_eq!(roles, ["system", "user", "assistant"]);
    }

    #[test]
    fn test_api_request_uses_default_model_when_empty() {
        let request = GenerationRequest::new("", vec![Message::user("hi")]).with_temperature(0.2);
        let body = ApiRequest::from_request(request, "fallback/model");
        assert_eq!(body.model, "fallback/model");
        assert_eq!(body.temperature, Some(0.2));

        let request = GenerationRequest::new("explicit/model", vec![]);
        let body = ApiRequest::from_request(request, "fallback/model");
        assert_eq!(body.model, "explicit/model");
    }

    #[test]
    fn test_api_response_conversion_tolerates_missing_fields() {
        let raw = r#"{
            "id": "gen-1",
            "model": "m",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": null}}]
        }"#;
        let parsed: ApiResponse = serde_json::from_str(raw).expect("valid json");
        let response: GenerationResponse = parsed.into();
        assert_eq!(response.first_content(), Some(""));
        assert_eq!(response.choices[0].finish_reason, "stop");
        assert_eq!(response.usage.total_tokens, 0);
    }

    #[test]
    fn test_litellm_client_accessors() {
        let client = LiteLlmClient::new(
            "http://localhost:4000".to_string(),
            None,
            "local/model".to_string(),
        )
        .expect("client builds");
        assert_eq!(client.api_base(), "http://localhost:4000");
        assert_eq!(client.default_model(), "local/model");
        assert!(!client.has_api_key());
    }
}
