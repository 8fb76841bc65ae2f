//! HTTP forecast provider for OpenAI-compatible chat endpoints.
//!
//! Most third-party forecasting capabilities are LLMs behind a chat
//! completions API, so one adapter covers them all: the provider record
//! supplies the base URL, model and key, and this adapter handles the
//! request, status mapping and strict JSON parsing of the forecast array.
//!
//! The adapter makes exactly one attempt per call; retry policy belongs
//! to the orchestrator.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;
use crate::providers::{validate_forecasts, Forecast, ForecastProvider, ProviderForecasts, ProviderRecord};

/// System prompt fixed for every forecast request.
const SYSTEM_PROMPT: &str =
    "You are a precise sports forecasting engine. Respond with JSON only, never prose.";

/// Generation temperature; forecasts should be stable, not creative.
const TEMPERATURE: f64 = 0.2;

/// HTTP adapter over an OpenAI-compatible chat completions endpoint.
pub struct HttpForecastProvider {
    id: String,
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl HttpForecastProvider {
    /// Builds an adapter from a persisted provider record, resolving the
    /// API key from the environment variable the record names.
    pub fn from_record(
        record: &ProviderRecord,
        request_timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let api_key = std::env::var(&record.api_key_env)
            .map_err(|_| AdapterError::MissingApiKey(record.id.clone()))?;
        Ok(Self::new(
            &record.id,
            &record.base_url,
            &record.model,
            api_key,
            request_timeout,
        ))
    }

    /// Builds an adapter from explicit parts. Useful for tests and
    /// OpenAI-compatible proxies.
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            client: Client::builder()
                .timeout(request_timeout)
                .build()
                .expect("Failed to build HTTP client - system TLS configuration error"),
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    /// The API key with the middle masked, for diagnostics.
    pub fn api_key_masked(&self) -> String {
        if self.api_key.len() <= 8 {
            "*".repeat(self.api_key.len())
        } else {
            format!(
                "{}...{}",
                &self.api_key[..4],
                &self.api_key[self.api_key.len() - 4..]
            )
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn execute_request(&self, prompt: &str) -> Result<String, AdapterError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: TEMPERATURE,
        };

        let http_response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;

        let status = http_response.status();

        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());

            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);

            if status_code == 429 {
                return Err(AdapterError::RateLimited(message));
            }
            return Err(AdapterError::Api {
                code: status_code,
                message,
            });
        }

        let api_response: ChatResponse = http_response
            .json()
            .await
            .map_err(|e| AdapterError::Parse(format!("invalid completion envelope: {}", e)))?;

        api_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| AdapterError::Parse("response contained no usable content".to_string()))
    }
}

#[async_trait]
impl ForecastProvider for HttpForecastProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn forecast_batch(
        &self,
        prompt: &str,
        fixture_ids: &[String],
    ) -> Result<ProviderForecasts, AdapterError> {
        let prompt = self.enhance_prompt(prompt);
        let raw_response = self.execute_request(&prompt).await?;
        let forecasts = parse_forecast_content(&raw_response)?;
        validate_forecasts(fixture_ids, &forecasts)?;

        Ok(ProviderForecasts {
            forecasts,
            raw_response,
        })
    }
}

/// Parses the model's content into forecasts keyed by fixture id.
///
/// Accepts a bare JSON array or one wrapped in a markdown code fence.
pub fn parse_forecast_content(
    content: &str,
) -> Result<HashMap<String, Forecast>, AdapterError> {
    let stripped = strip_code_fence(content);

    let entries: Vec<ForecastEntry> = serde_json::from_str(stripped)
        .map_err(|e| AdapterError::Parse(format!("invalid forecast JSON: {}", e)))?;

    if entries.is_empty() {
        return Err(AdapterError::Parse("forecast array was empty".to_string()));
    }

    let mut forecasts = HashMap::with_capacity(entries.len());
    for entry in entries {
        forecasts.insert(entry.fixture_id, entry.forecast);
    }
    Ok(forecasts)
}

/// Strips a surrounding ```/```json fence if present.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// One element of the forecast array the prompt demands.
#[derive(Debug, Deserialize)]
struct ForecastEntry {
    fixture_id: String,
    #[serde(flatten)]
    forecast: Forecast,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Outcome;

    const VALID_CONTENT: &str = r#"[
        {"fixture_id": "f1", "outcome": "home", "home_score": 2, "away_score": 0, "confidence": 0.8},
        {"fixture_id": "f2", "outcome": "draw", "home_score": 1, "away_score": 1, "confidence": 0.55}
    ]"#;

    fn provider() -> HttpForecastProvider {
        HttpForecastProvider::new(
            "test-provider",
            "http://localhost:65535/v1",
            "test-model",
            "sk-1234567890abcdef",
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_parse_valid_content() {
        let forecasts = parse_forecast_content(VALID_CONTENT).expect("parses");
        assert_eq!(forecasts.len(), 2);
        assert_eq!(forecasts["f1"].outcome, Outcome::Home);
        assert_eq!(forecasts["f2"].home_score, 1);
    }

    #[test]
    fn test_parse_fenced_content() {
        let fenced = format!("```json\n{}\n```", VALID_CONTENT);
        let forecasts = parse_forecast_content(&fenced).expect("parses");
        assert_eq!(forecasts.len(), 2);
    }

    #[test]
    fn test_parse_malformed_content_is_retryable() {
        let err = parse_forecast_content("the forecast is: Arsenal wins").unwrap_err();
        assert!(matches!(err, AdapterError::Parse(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_parse_empty_array_is_parse_error() {
        let err = parse_forecast_content("[]").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_api_key_masked() {
        assert_eq!(provider().api_key_masked(), "sk-1...cdef");

        let short = HttpForecastProvider::new(
            "p",
            "http://localhost/v1",
            "m",
            "abc",
            Duration::from_secs(1),
        );
        assert_eq!(short.api_key_masked(), "***");
    }

    #[test]
    fn test_enhance_prompt_default_is_identity() {
        let p = provider();
        assert_eq!(p.enhance_prompt("hello"), "hello");
    }

    #[tokio::test]
    async fn test_forecast_batch_connection_error_is_network() {
        let p = provider();
        let err = p
            .forecast_batch("prompt", &["f1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Network(_)));
    }

    #[test]
    fn test_from_record_missing_key() {
        let record = ProviderRecord {
            id: "acme".into(),
            display_name: "Acme".into(),
            model: "acme-1".into(),
            base_url: "https://api.acme.dev/v1".into(),
            api_key_env: "MATCHCAST_TEST_UNSET_KEY".into(),
            active: true,
            auto_disabled: false,
            consecutive_failures: 0,
            cost_per_1m_input: 1.0,
            cost_per_1m_output: 2.0,
        };
        let result = HttpForecastProvider::from_record(&record, Duration::from_secs(5));
        assert!(matches!(result, Err(AdapterError::MissingApiKey(_))));
    }
}
