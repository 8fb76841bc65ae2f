//! Error types shared across the forecast pipeline.
//!
//! Subsystems that own infrastructure (queue, storage, worker pool) define
//! their error enums next to the code; this module holds the errors that
//! cross module boundaries:
//!
//! - `AdapterError`: typed failures from provider adapters, carrying the
//!   retry classification used by the orchestrator
//! - `OrchestratorError`: top-level failures of a generation run

use thiserror::Error;

/// Typed failure from a forecast provider adapter.
///
/// The orchestrator's retry policy is driven entirely by this type:
/// only [`AdapterError::Parse`] is retried in-loop, rate limits are
/// escalated to the queue-level circuit breaker, and validation failures
/// are terminal.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Response could not be parsed into per-fixture forecasts
    /// (empty body, malformed JSON, no usable content).
    #[error("Failed to parse provider response: {0}")]
    Parse(String),

    /// Provider signalled throttling (HTTP 429 or equivalent).
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Provider returned a non-success status that is not a rate limit.
    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    /// Transport-level failure (connect, TLS, timeout).
    #[error("Request failed: {0}")]
    Network(String),

    /// Output failed a domain sanity check, e.g. forecasts for fixtures
    /// that were never requested. Never retried, never re-billed.
    #[error("Forecast validation failed: {0}")]
    Validation(String),

    /// Provider is missing required credentials.
    #[error("Missing API key for provider '{0}'")]
    MissingApiKey(String),
}

impl AdapterError {
    /// Whether the orchestrator should re-attempt the same call.
    ///
    /// Only malformed-output failures are considered transient enough to
    /// retry against the same provider; everything else either will not
    /// improve on retry or is handled at the queue level.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Parse(_))
    }

    /// Whether this failure should feed the queue circuit breaker.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, AdapterError::RateLimited(_))
    }
}

/// Errors that abort an entire orchestrator run.
///
/// Per-provider and per-batch failures are accumulated into the run
/// summary instead; only failures that prevent the run from starting at
/// all surface through this type.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Ready fixtures could not be loaded from storage.
    #[error("Failed to load ready fixtures: {0}")]
    LoadFixtures(String),

    /// Provider registry could not be loaded.
    #[error("Failed to load providers: {0}")]
    LoadProviders(String),

    /// Storage error outside the per-provider error accumulation path.
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StoreError),

    /// Prompt template rendering failed for a batch.
    #[error("Prompt rendering failed: {0}")]
    Prompt(#[from] tera::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_errors_are_retryable() {
        assert!(AdapterError::Parse("empty response".into()).is_retryable());
        assert!(!AdapterError::Parse("empty response".into()).is_rate_limit());
    }

    #[test]
    fn test_rate_limit_not_retryable_in_loop() {
        let err = AdapterError::RateLimited("429 too many requests".into());
        assert!(!err.is_retryable());
        assert!(err.is_rate_limit());
    }

    #[test]
    fn test_terminal_errors() {
        assert!(!AdapterError::Validation("unknown team".into()).is_retryable());
        assert!(!AdapterError::Network("connection refused".into()).is_retryable());
        assert!(!AdapterError::Api {
            code: 401,
            message: "unauthorized".into()
        }
        .is_retryable());
        assert!(!AdapterError::MissingApiKey("acme".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = AdapterError::Api {
            code: 503,
            message: "overloaded".into(),
        };
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("overloaded"));
    }
}
