//! Forecast provider capability interface.
//!
//! A provider wraps one external forecasting capability: given the shared
//! batch prompt and the fixture ids it covers, it returns per-fixture
//! forecasts or a typed [`AdapterError`]. Providers are stateless per call;
//! registration, health and budget state live outside the adapter.
//!
//! Every provider implements the same trait. Capabilities that only some
//! vendors support (enhanced prompting) are default trait methods with a
//! no-op fallback, not runtime feature detection.

pub mod http;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;

pub use http::HttpForecastProvider;

/// Highest plausible goal count accepted from a provider.
const MAX_SANE_SCORE: u32 = 15;

/// Predicted match outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Home,
    Draw,
    Away,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Home => write!(f, "home"),
            Outcome::Draw => write!(f, "draw"),
            Outcome::Away => write!(f, "away"),
        }
    }
}

/// One provider's forecast for one fixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub outcome: Outcome,
    pub home_score: u32,
    pub away_score: u32,
    /// Provider-reported confidence in [0, 1].
    pub confidence: f64,
}

/// Result of one successful batch call: forecasts keyed by fixture id
/// plus the raw response retained for provenance.
#[derive(Debug, Clone)]
pub struct ProviderForecasts {
    pub forecasts: HashMap<String, Forecast>,
    pub raw_response: String,
}

/// A registered forecasting capability, as persisted.
///
/// `active` is toggled by configuration sync; `auto_disabled` and
/// `consecutive_failures` are owned by the model health tracker. Disabled
/// providers stay disabled until an external reactivation clears the flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Stable slug, e.g. "openrouter-kimi".
    pub id: String,
    /// Human-readable name for alerts and summaries.
    pub display_name: String,
    /// Model identifier passed to the vendor endpoint.
    pub model: String,
    /// OpenAI-compatible chat completions base URL.
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Whether configuration sync has this provider enabled.
    pub active: bool,
    /// Set by the health tracker after repeated consecutive failures.
    pub auto_disabled: bool,
    /// Current consecutive call-outcome failure count.
    pub consecutive_failures: u32,
    /// Cost per one million input tokens, in dollars.
    pub cost_per_1m_input: f64,
    /// Cost per one million output tokens, in dollars.
    pub cost_per_1m_output: f64,
}

impl ProviderRecord {
    /// Whether this provider may be considered for dispatch at all.
    /// Budget eligibility is checked separately, per batch.
    pub fn is_enabled(&self) -> bool {
        self.active && !self.auto_disabled
    }
}

/// Capability interface all forecast providers implement.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    /// Stable provider id, matching its [`ProviderRecord`].
    fn id(&self) -> &str;

    /// Requests forecasts for every fixture id in `fixture_ids` using the
    /// shared batch `prompt`. Partial responses are allowed; the caller
    /// treats omitted fixtures as per-item gaps.
    async fn forecast_batch(
        &self,
        prompt: &str,
        fixture_ids: &[String],
    ) -> Result<ProviderForecasts, AdapterError>;

    /// Providers that support richer structured prompting may rewrite the
    /// shared prompt here. The default is the identity transform.
    fn enhance_prompt(&self, prompt: &str) -> String {
        prompt.to_string()
    }
}

/// Domain-level sanity check on a parsed forecast set.
///
/// Forecasts for fixtures that were never requested are treated as
/// hallucinated output and fail the whole call; out-of-range scores and
/// confidences likewise. Missing fixtures are not an error here.
pub fn validate_forecasts(
    fixture_ids: &[String],
    forecasts: &HashMap<String, Forecast>,
) -> Result<(), AdapterError> {
    let requested: std::collections::HashSet<&str> =
        fixture_ids.iter().map(String::as_str).collect();

    for (fixture_id, forecast) in forecasts {
        if !requested.contains(fixture_id.as_str()) {
            return Err(AdapterError::Validation(format!(
                "forecast for unknown fixture '{}'",
                fixture_id
            )));
        }
        if forecast.home_score > MAX_SANE_SCORE || forecast.away_score > MAX_SANE_SCORE {
            return Err(AdapterError::Validation(format!(
                "implausible score {}-{} for fixture '{}'",
                forecast.home_score, forecast.away_score, fixture_id
            )));
        }
        if !(0.0..=1.0).contains(&forecast.confidence) {
            return Err(AdapterError::Validation(format!(
                "confidence {} out of range for fixture '{}'",
                forecast.confidence, fixture_id
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forecast() -> Forecast {
        Forecast {
            outcome: Outcome::Home,
            home_score: 2,
            away_score: 1,
            confidence: 0.7,
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_validate_accepts_complete_result() {
        let mut forecasts = HashMap::new();
        forecasts.insert("f1".to_string(), forecast());
        forecasts.insert("f2".to_string(), forecast());
        assert!(validate_forecasts(&ids(&["f1", "f2"]), &forecasts).is_ok());
    }

    #[test]
    fn test_validate_accepts_partial_result() {
        let mut forecasts = HashMap::new();
        forecasts.insert("f1".to_string(), forecast());
        // f2 missing: a gap, not a validation failure
        assert!(validate_forecasts(&ids(&["f1", "f2"]), &forecasts).is_ok());
    }

    #[test]
    fn test_validate_rejects_hallucinated_fixture() {
        let mut forecasts = HashMap::new();
        forecasts.insert("made-up".to_string(), forecast());
        let err = validate_forecasts(&ids(&["f1"]), &forecasts).unwrap_err();
        assert!(matches!(err, AdapterError::Validation(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validate_rejects_implausible_score() {
        let mut forecasts = HashMap::new();
        forecasts.insert(
            "f1".to_string(),
            Forecast {
                home_score: 42,
                ..forecast()
            },
        );
        assert!(validate_forecasts(&ids(&["f1"]), &forecasts).is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_confidence() {
        let mut forecasts = HashMap::new();
        forecasts.insert(
            "f1".to_string(),
            Forecast {
                confidence: 1.5,
                ..forecast()
            },
        );
        assert!(validate_forecasts(&ids(&["f1"]), &forecasts).is_err());
    }

    #[test]
    fn test_outcome_serde_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&Outcome::Home).expect("serializes"),
            "\"home\""
        );
        let parsed: Outcome = serde_json::from_str("\"draw\"").expect("deserializes");
        assert_eq!(parsed, Outcome::Draw);
    }

    #[test]
    fn test_provider_record_enabled() {
        let record = ProviderRecord {
            id: "p1".into(),
            display_name: "Provider One".into(),
            model: "test-model".into(),
            base_url: "https://api.example.com/v1".into(),
            api_key_env: "P1_API_KEY".into(),
            active: true,
            auto_disabled: false,
            consecutive_failures: 0,
            cost_per_1m_input: 1.0,
            cost_per_1m_output: 3.0,
        };
        assert!(record.is_enabled());

        let disabled = ProviderRecord {
            auto_disabled: true,
            ..record.clone()
        };
        assert!(!disabled.is_enabled());

        let inactive = ProviderRecord {
            active: false,
            ..record
        };
        assert!(!inactive.is_enabled());
    }
}
