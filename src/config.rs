//! Pipeline configuration.
//!
//! All tunables for the generation pipeline and its protection layer live
//! here: batch sizing, concurrency, retry policy, budget cap, circuit
//! breaker thresholds, and monitor windows. Values come from `MATCHCAST_*`
//! environment variables with sensible defaults.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
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
}

/// Configuration for the forecast generation pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Batching
    /// Number of fixtures grouped into one shared prompt.
    pub batch_size: usize,
    /// Maximum providers dispatched concurrently within a batch.
    pub max_concurrent_providers: usize,

    // Retry policy (retryable-parse failures only)
    /// Extra attempts after the initial call.
    pub max_retries: u32,
    /// Delay before the first retry; doubles per retry.
    pub retry_base_delay: Duration,

    // Provider adapter
    /// Per-call HTTP timeout for provider requests.
    pub request_timeout: Duration,
    /// Estimated prompt tokens per fixture, used for cost accounting.
    pub est_input_tokens_per_fixture: u32,
    /// Estimated completion tokens per fixture.
    pub est_output_tokens_per_fixture: u32,

    // Budget
    /// Global daily spending cap in dollars across all providers.
    pub daily_budget: f64,

    // Model health
    /// Consecutive call-outcome failures before a provider is disabled.
    pub auto_disable_threshold: u32,

    // Circuit breaker
    /// Consecutive rate-limit errors before the queue is paused.
    pub circuit_threshold: u32,
    /// How long a paused queue stays paused before the timed resume.
    pub circuit_cooldown: Duration,

    // Monitors
    /// A job in flight longer than this counts as stalled.
    pub stall_threshold: Duration,
    /// Fixtures finished longer ago than this must have predictions.
    pub completeness_window: Duration,
    /// Maximum fixture ids included in a completeness alert.
    pub alert_sample_size: usize,

    // Infrastructure
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Redis connection URL.
    pub redis_url: String,
    /// Name of the generation job queue.
    pub queue_name: String,
    /// Number of queue workers.
    pub num_workers: usize,
    /// Maximum wall time for one queue job.
    pub job_timeout: Duration,

    // Trigger endpoint
    /// Listen address for the HTTP trigger server.
    pub listen_addr: String,
    /// Shared-secret bearer token for the trigger endpoint.
    pub api_token: String,
    /// Optional webhook URL for alert egress; falls back to log-only.
    pub alert_webhook_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_providers: 5,
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(120),
            est_input_tokens_per_fixture: 350,
            est_output_tokens_per_fixture: 120,
            daily_budget: 50.0,
            auto_disable_threshold: 3,
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_secs(60),
            stall_threshold: Duration::from_secs(300),
            completeness_window: Duration::from_secs(24 * 3600),
            alert_sample_size: 10,
            database_url: "postgres://localhost/matchcast".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "generation".to_string(),
            num_workers: 2,
            job_timeout: Duration::from_secs(1800),
            listen_addr: "0.0.0.0:8080".to_string(),
            api_token: String::new(),
            alert_webhook_url: None,
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from environment variables.
    ///
    /// `DATABASE_URL` and `MATCHCAST_API_TOKEN` are required; everything
    /// else falls back to the defaults above.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MATCHCAST_BATCH_SIZE") {
            config.batch_size = parse_env_value(&val, "MATCHCAST_BATCH_SIZE")?;
        }

        if let Ok(val) = std::env::var("MATCHCAST_MAX_CONCURRENT_PROVIDERS") {
            config.max_concurrent_providers =
                parse_env_value(&val, "MATCHCAST_MAX_CONCURRENT_PROVIDERS")?;
        }

        if let Ok(val) = std::env::var("MATCHCAST_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "MATCHCAST_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("MATCHCAST_RETRY_BASE_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "MATCHCAST_RETRY_BASE_DELAY_MS")?;
            config.retry_base_delay = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("MATCHCAST_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "MATCHCAST_REQUEST_TIMEOUT_SECS")?;
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("MATCHCAST_DAILY_BUDGET") {
            config.daily_budget = parse_env_value(&val, "MATCHCAST_DAILY_BUDGET")?;
        }

        if let Ok(val) = std::env::var("MATCHCAST_AUTO_DISABLE_THRESHOLD") {
            config.auto_disable_threshold =
                parse_env_value(&val, "MATCHCAST_AUTO_DISABLE_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("MATCHCAST_CIRCUIT_THRESHOLD") {
            config.circuit_threshold = parse_env_value(&val, "MATCHCAST_CIRCUIT_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("MATCHCAST_CIRCUIT_COOLDOWN_SECS") {
            let secs: u64 = parse_env_value(&val, "MATCHCAST_CIRCUIT_COOLDOWN_SECS")?;
            config.circuit_cooldown = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("MATCHCAST_STALL_THRESHOLD_SECS") {
            let secs: u64 = parse_env_value(&val, "MATCHCAST_STALL_THRESHOLD_SECS")?;
            config.stall_threshold = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("MATCHCAST_COMPLETENESS_WINDOW_HOURS") {
            let hours: u64 = parse_env_value(&val, "MATCHCAST_COMPLETENESS_WINDOW_HOURS")?;
            config.completeness_window = Duration::from_secs(hours * 3600);
        }

        if let Ok(val) = std::env::var("MATCHCAST_ALERT_SAMPLE_SIZE") {
            config.alert_sample_size = parse_env_value(&val, "MATCHCAST_ALERT_SAMPLE_SIZE")?;
        }

        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        if let Ok(val) = std::env::var("REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("MATCHCAST_QUEUE_NAME") {
            config.queue_name = val;
        }

        if let Ok(val) = std::env::var("MATCHCAST_NUM_WORKERS") {
            config.num_workers = parse_env_value(&val, "MATCHCAST_NUM_WORKERS")?;
        }

        if let Ok(val) = std::env::var("MATCHCAST_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "MATCHCAST_JOB_TIMEOUT_SECS")?;
            config.job_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("MATCHCAST_LISTEN_ADDR") {
            config.listen_addr = val;
        }

        config.api_token = std::env::var("MATCHCAST_API_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("MATCHCAST_API_TOKEN".to_string()))?;

        config.alert_webhook_url = std::env::var("MATCHCAST_ALERT_WEBHOOK_URL").ok();

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_providers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_providers must be greater than 0".to_string(),
            ));
        }

        if self.daily_budget <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "daily_budget must be positive".to_string(),
            ));
        }

        if self.auto_disable_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "auto_disable_threshold must be greater than 0".to_string(),
            ));
        }

        if self.circuit_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "circuit_threshold must be greater than 0".to_string(),
            ));
        }

        if self.circuit_cooldown.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "circuit_cooldown must be greater than 0".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_concurrent_providers, 5);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.circuit_threshold, 5);
        assert_eq!(config.circuit_cooldown, Duration::from_secs(60));
        assert_eq!(config.stall_threshold, Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let config = PipelineConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_circuit_threshold() {
        let config = PipelineConfig {
            circuit_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_positive_budget() {
        let config = PipelineConfig {
            daily_budget: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_env_value() {
        let parsed: usize = parse_env_value("42", "KEY").expect("valid number");
        assert_eq!(parsed, 42);

        let err = parse_env_value::<usize>("not-a-number", "KEY").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
