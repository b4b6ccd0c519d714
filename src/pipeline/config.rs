//! Runtime settings and the quality gate.
//!
//! [`PipelineConfig`] starts from defaults and is overridden by `STYLEFORGE_*`
//! environment variables; the CLI applies its own flags on top.

use std::time::Duration;
use thiserror::Error;

use crate::llm::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} is set but unusable: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid configuration: {0}")]
    ValidationFailed(String),
}

/// Outcome of the quality gate after a `quality_assessment` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Completed,
    /// Re-run from `design_adaptation` with the iteration count incremented.
    Retry,
    Failed,
}

/// Thresholds and iteration cap for the quality gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityPolicy {
    pub max_iterations: u32,
    pub acceptable_threshold: f64,
    pub excellent_threshold: f64,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            acceptable_threshold: 0.6,
            excellent_threshold: 0.8,
        }
    }
}

impl QualityPolicy {
    /// Applies the gate rules in priority order:
    ///
    /// 1. a blocking issue fails the run;
    /// 2. at the iteration cap the run completes iff the score is acceptable;
    /// 3. an excellent score completes the run;
    /// 4. an acceptable score asks for another iteration;
    /// 5. anything else fails.
    ///
    /// A missing score counts as 0.
    pub fn decide(&self, has_blocking_issue: bool, iteration: u32, score: Option<f64>) -> Decision {
        let score = score.unwrap_or(0.0);

        if has_blocking_issue {
            return Decision::Failed;
        }
        if iteration >= self.max_iterations {
            return if score >= self.acceptable_threshold {
                Decision::Completed
            } else {
                Decision::Failed
            };
        }
        if score >= self.excellent_threshold {
            return Decision::Completed;
        }
        if score >= self.acceptable_threshold {
            return Decision::Retry;
        }
        Decision::Failed
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.acceptable_threshold) {
            return Err(ConfigError::ValidationFailed(
                "acceptable_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.excellent_threshold) {
            return Err(ConfigError::ValidationFailed(
                "excellent_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.acceptable_threshold > self.excellent_threshold {
            return Err(ConfigError::ValidationFailed(
                "acceptable_threshold cannot exceed excellent_threshold".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration for the styling pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// SQLite connection URL.
    pub database_url: String,

    /// Model to request; empty means the provider's default.
    pub model: String,
    pub temperature: f64,
    /// Completion token cap per request.
    pub max_tokens: u32,
    /// Attempts per LLM request, first try included.
    pub llm_max_attempts: u32,
    /// Base delay for exponential backoff between LLM attempts.
    pub llm_base_delay: Duration,

    pub quality: QualityPolicy,

    /// Reported to callers as the expected processing time of a new task.
    pub estimated_time: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://styleforge.db".to_string(),

            model: String::new(),
            temperature: 0.3,
            max_tokens: 4096,
            llm_max_attempts: 3,
            llm_base_delay: Duration::from_millis(1000),

            quality: QualityPolicy::default(),

            estimated_time: Duration::from_secs(60),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the environment, then validated.
    ///
    /// - `DATABASE_URL`: SQLite connection URL (default: sqlite://styleforge.db)
    /// - `STYLEFORGE_MODEL`: LLM model (default: provider default)
    /// - `STYLEFORGE_TEMPERATURE`: LLM temperature (default: 0.3)
    /// - `STYLEFORGE_MAX_TOKENS`: completion token cap (default: 4096)
    /// - `STYLEFORGE_LLM_MAX_ATTEMPTS`: attempts per LLM request (default: 3)
    /// - `STYLEFORGE_LLM_BASE_DELAY_MS`: backoff base delay (default: 1000)
    /// - `STYLEFORGE_MAX_ITERATIONS`: quality gate iteration cap (default: 3)
    /// - `STYLEFORGE_ACCEPTABLE_THRESHOLD`: acceptable score (default: 0.6)
    /// - `STYLEFORGE_EXCELLENT_THRESHOLD`: excellent score (default: 0.8)
    /// - `STYLEFORGE_ESTIMATED_TIME_SECS`: reported estimate (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = env_override::<String>("DATABASE_URL")? {
            config.database_url = url;
        }
        if let Some(model) = env_override::<String>("STYLEFORGE_MODEL")? {
            config.model = model;
        }
        if let Some(t) = env_override("STYLEFORGE_TEMPERATURE")? {
            config.temperature = t;
        }
        if let Some(n) = env_override("STYLEFORGE_MAX_TOKENS")? {
            config.max_tokens = n;
        }
        if let Some(n) = env_override("STYLEFORGE_LLM_MAX_ATTEMPTS")? {
            config.llm_max_attempts = n;
        }
        if let Some(ms) = env_override("STYLEFORGE_LLM_BASE_DELAY_MS")? {
            config.llm_base_delay = Duration::from_millis(ms);
        }
        if let Some(n) = env_override("STYLEFORGE_MAX_ITERATIONS")? {
            config.quality.max_iterations = n;
        }
        if let Some(score) = env_override("STYLEFORGE_ACCEPTABLE_THRESHOLD")? {
            config.quality.acceptable_threshold = score;
        }
        if let Some(score) = env_override("STYLEFORGE_EXCELLENT_THRESHOLD")? {
            config.quality.excellent_threshold = score;
        }
        if let Some(secs) = env_override("STYLEFORGE_ESTIMATED_TIME_SECS")? {
            config.estimated_time = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let problem = if self.database_url.trim().is_empty() {
            Some("database_url is empty")
        } else if !(0.0..=2.0).contains(&self.temperature) {
            Some("temperature must lie in 0.0..=2.0")
        } else if self.max_tokens == 0 {
            Some("max_tokens must be positive")
        } else if self.llm_max_attempts == 0 {
            Some("llm_max_attempts must be positive")
        } else {
            None
        };
        match problem {
            Some(message) => Err(ConfigError::ValidationFailed(message.to_string())),
            None => self.quality.validate(),
        }
    }

    /// Backoff policy for the LLM retry wrapper.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.llm_max_attempts, self.llm_base_delay)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_llm_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.llm_max_attempts = max_attempts;
        self.llm_base_delay = base_delay;
        self
    }

    pub fn with_quality_policy(mut self, policy: QualityPolicy) -> Self {
        self.quality = policy;
        self
    }

    pub fn with_estimated_time(mut self, estimate: Duration) -> Self {
        self.estimated_time = estimate;
        self
    }
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{}' does not parse", value),
    })
}

/// `Ok(None)` when the variable is unset.
fn env_override<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    std::env::var(key)
        .ok()
        .map(|value| parse_env_value(&value, key))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = PipelineConfig::default();
        assert_eq!(config.database_url, "sqlite://styleforge.db");
        assert!(config.model.is_empty());
        assert_eq!(config.quality, QualityPolicy::default());
        assert_eq!(config.quality.max_iterations, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = PipelineConfig::new()
            .with_database_url("sqlite::memory:")
            .with_model("openai/gpt-4o")
            .with_temperature(0.9)
            .with_llm_retry(5, Duration::from_millis(10))
            .with_estimated_time(Duration::from_secs(5));

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.model, "openai/gpt-4o");
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(10));
        assert_eq!(config.estimated_time, Duration::from_secs(5));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(PipelineConfig::new().with_temperature(3.0).validate().is_err());
        assert!(PipelineConfig::new().with_max_tokens(0).validate().is_err());
        assert!(PipelineConfig::new().with_database_url("").validate().is_err());

        let inverted = QualityPolicy {
            acceptable_threshold: 0.9,
            excellent_threshold: 0.8,
            ..QualityPolicy::default()
        };
        assert!(PipelineConfig::new()
            .with_quality_policy(inverted)
            .validate()
            .is_err());
    }

    #[test]
    fn test_decide_blocking_issue_wins() {
        let policy = QualityPolicy::default();
        assert_eq!(policy.decide(true, 0, Some(0.95)), Decision::Failed);
        assert_eq!(policy.decide(true, 3, Some(0.95)), Decision::Failed);
    }

    #[test]
    fn test_decide_thresholds_before_cap() {
        let policy = QualityPolicy::default();
        assert_eq!(policy.decide(false, 0, Some(0.8)), Decision::Completed);
        assert_eq!(policy.decide(false, 0, Some(0.79)), Decision::Retry);
        assert_eq!(policy.decide(false, 2, Some(0.6)), Decision::Retry);
        assert_eq!(policy.decide(false, 0, Some(0.59)), Decision::Failed);
        assert_eq!(policy.decide(false, 0, None), Decision::Failed);
    }

    #[test]
    fn test_decide_at_iteration_cap() {
        let policy = QualityPolicy::default();
        assert_eq!(policy.decide(false, 3, Some(0.6)), Decision::Completed);
        assert_eq!(policy.decide(false, 3, Some(0.7)), Decision::Completed);
        assert_eq!(policy.decide(false, 3, Some(0.59)), Decision::Failed);
    }

    #[test]
    fn test_parse_env_value() {
        let parsed: u32 = parse_env_value(" 7 ", "KEY").unwrap();
        assert_eq!(parsed, 7);
        let err = parse_env_value::<f64>("abc", "KEY").unwrap_err();
        assert!(err.to_string().contains("KEY"));
    }
}
