//! Retry-with-backoff wrapper around any [`LlmProvider`].
//!
//! Transient generation faults are absorbed here, below the stage boundary,
//! so the workflow engine never observes them. Hard faults and the last
//! transient fault after the final attempt are returned unchanged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::litellm::{GenerationRequest, GenerationResponse, LlmProvider};
use crate::error::LlmError;
use crate::metrics::MetricsCollector;

/// Default maximum number of attempts (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Backoff policy for [`RetryingProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before attempt `attempt` (0-based). Doubles each time: 1x, 2x, 4x...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

/// Provider decorator adding exponential backoff on transient errors.
pub struct RetryingProvider {
    inner: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl LlmProvider for RetryingProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let metrics = MetricsCollector::new();
        let mut last_error = None;

        for attempt in 0..self.policy.max_attempts {
            if attempt > 0 {
                let delay = self.policy.delay_for(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying LLM request after transient failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self.inner.generate(request.clone()).await {
                Ok(response) => {
                    metrics.record_llm_attempt("success");
                    return Ok(response);
                }
                Err(err) if err.is_transient() => {
                    metrics.record_llm_attempt("transient");
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_attempts,
                        error = %err,
                        "Transient LLM error"
                    );
                    last_error = Some(err);
                }
                Err(err) => {
                    metrics.record_llm_attempt("hard");
                    return Err(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            LlmError::RequestFailed("Max retries exceeded with no error captured".to_string())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Choice, Message, Usage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Provider that fails with the scripted errors, then succeeds.
    struct FlakyProvider {
        failures: Mutex<Vec<LlmError>>,
        calls: AtomicUsize,
    }

    impl FlakyProvider {
        fn new(failures: Vec<LlmError>) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut failures = self.failures.lock().expect("lock not poisoned");
                if failures.is_empty() {
                    None
                } else {
                    Some(failures.remove(0))
                }
            };
            match next {
                Some(err) => Err(err),
                None => Ok(GenerationResponse {
                    id: "ok".to_string(),
                    model: "mock".to_string(),
                    choices: vec![Choice {
                        index: 0,
                        message: Message::assistant("done"),
                        finish_reason: "stop".to_string(),
                    }],
                    usage: Usage::default(),
                }),
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let inner = Arc::new(FlakyProvider::new(vec![
            LlmError::RateLimited("429".to_string()),
            LlmError::Timeout("slow".to_string()),
        ]));
        let provider = RetryingProvider::new(inner.clone(), fast_policy(3));

        let response = provider
            .generate(GenerationRequest::new("", vec![]))
            .await
            .expect("third attempt succeeds");
        assert_eq!(response.first_content(), Some("done"));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_hard_errors_fail_immediately() {
        let inner = Arc::new(FlakyProvider::new(vec![LlmError::ApiError {
            code: 401,
            message: "unauthorized".to_string(),
        }]));
        let provider = RetryingProvider::new(inner.clone(), fast_policy(3));

        let result = provider.generate(GenerationRequest::new("", vec![])).await;
        assert!(matches!(result, Err(LlmError::ApiError { code: 401, .. })));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let inner = Arc::new(FlakyProvider::new(vec![
            LlmError::Timeout("1".to_string()),
            LlmError::Timeout("2".to_string()),
            LlmError::Timeout("3".to_string()),
        ]));
        let provider = RetryingProvider::new(inner.clone(), fast_policy(2));

        let result = provider.generate(GenerationRequest::new("", vec![])).await;
        match result {
            Err(LlmError::Timeout(msg)) => assert_eq!(msg, "2"),
            other => panic!("expected timeout, got {:?}", other.map(|r| r.id)),
        }
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
