//! Fixture work items and batch construction.
//!
//! A `Fixture` is one scheduled match awaiting forecasts. Fixtures are
//! created upstream and are read-only inside the pipeline; this module
//! groups them into fixed-size batches and renders the single shared
//! prompt each batch sends to every provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tera::{Context, Tera};

/// One scheduled match awaiting a forecast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fixture {
    /// Upstream identifier, stable across runs.
    pub id: String,
    /// Home participant name.
    pub home: String,
    /// Away participant name.
    pub away: String,
    /// Competition or league context (e.g. "Premier League").
    pub competition: String,
    /// Scheduled kickoff time.
    pub kickoff: DateTime<Utc>,
    /// Optional pre-computed analysis payload from upstream (form,
    /// head-to-head, injuries). Passed verbatim into the prompt.
    #[serde(default)]
    pub analysis: Option<serde_json::Value>,
}

impl Fixture {
    /// Creates a fixture with no analysis payload.
    pub fn new(
        id: impl Into<String>,
        home: impl Into<String>,
        away: impl Into<String>,
        competition: impl Into<String>,
        kickoff: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            home: home.into(),
            away: away.into(),
            competition: competition.into(),
            kickoff,
            analysis: None,
        }
    }

    /// Attaches an upstream analysis payload.
    pub fn with_analysis(mut self, analysis: serde_json::Value) -> Self {
        self.analysis = Some(analysis);
        self
    }
}

/// A fixed-size group of fixtures sharing one rendered prompt.
///
/// Batches exist only for the duration of an orchestrator run.
#[derive(Debug, Clone)]
pub struct FixtureBatch {
    /// Zero-based position within the run.
    pub index: usize,
    /// The fixtures in this batch, in input order.
    pub fixtures: Vec<Fixture>,
    /// The shared prompt sent to every provider for this batch.
    pub prompt: String,
}

impl FixtureBatch {
    /// The fixture ids in this batch, in order.
    pub fn fixture_ids(&self) -> Vec<String> {
        self.fixtures.iter().map(|f| f.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }
}

/// Tera template for the shared batch prompt.
///
/// Providers must answer with a JSON array keyed by fixture id so partial
/// results can be attributed; the parsing side lives in `providers::http`.
const BATCH_PROMPT_TEMPLATE: &str = r#"You are a football match forecaster.
Predict the outcome of every fixture below. Respond with a JSON array only,
no prose. Each element must have this exact shape:
{"fixture_id": "<id>", "outcome": "home|draw|away", "home_score": <int>, "away_score": <int>, "confidence": <0.0-1.0>}

Fixtures:
{% for f in fixtures %}- fixture_id: {{ f.id }}
  {{ f.home }} vs {{ f.away }} ({{ f.competition }}), kickoff {{ f.kickoff }}
{%- if f.analysis %}
  analysis: {{ f.analysis | json_encode() }}
{%- endif %}
{% endfor %}
Return exactly {{ count }} elements, one per fixture_id listed above."#;

/// Partitions ready fixtures into batches of at most `batch_size`.
///
/// The last batch may be smaller; order is preserved. An empty input
/// yields zero batches.
pub fn partition(fixtures: Vec<Fixture>, batch_size: usize) -> Vec<Vec<Fixture>> {
    assert!(batch_size > 0, "batch_size must be non-zero");
    let mut batches = Vec::with_capacity(fixtures.len().div_ceil(batch_size));
    let mut current = Vec::with_capacity(batch_size);
    for fixture in fixtures {
        current.push(fixture);
        if current.len() == batch_size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(batch_size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Renders the shared prompt for one batch of fixtures.
pub fn render_batch_prompt(fixtures: &[Fixture]) -> Result<String, tera::Error> {
    let mut context = Context::new();
    context.insert("fixtures", fixtures);
    context.insert("count", &fixtures.len());
    Tera::one_off(BATCH_PROMPT_TEMPLATE, &context, false)
}

/// Builds the ordered batches for one orchestrator run, rendering one
/// prompt per batch.
pub fn build_batches(
    fixtures: Vec<Fixture>,
    batch_size: usize,
) -> Result<Vec<FixtureBatch>, tera::Error> {
    partition(fixtures, batch_size)
        .into_iter()
        .enumerate()
        .map(|(index, fixtures)| {
            let prompt = render_batch_prompt(&fixtures)?;
            Ok(FixtureBatch {
                index,
                fixtures,
                prompt,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(id: &str) -> Fixture {
        Fixture::new(id, "Arsenal", "Chelsea", "Premier League", Utc::now())
    }

    #[test]
    fn test_partition_exact_multiple() {
        let fixtures: Vec<_> = (0..20).map(|i| fixture(&format!("f{}", i))).collect();
        let batches = partition(fixtures, 10);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(batches[1].len(), 10);
    }

    #[test]
    fn test_partition_trailing_partial_batch() {
        // 23 fixtures at batch size 10 -> 10, 10, 3
        let fixtures: Vec<_> = (0..23).map(|i| fixture(&format!("f{}", i))).collect();
        let batches = partition(fixtures, 10);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(batches[1].len(), 10);
        assert_eq!(batches[2].len(), 3);
    }

    #[test]
    fn test_partition_preserves_order() {
        let fixtures: Vec<_> = (0..5).map(|i| fixture(&format!("f{}", i))).collect();
        let batches = partition(fixtures, 2);
        assert_eq!(batches[0][0].id, "f0");
        assert_eq!(batches[0][1].id, "f1");
        assert_eq!(batches[2][0].id, "f4");
    }

    #[test]
    fn test_partition_empty_input() {
        let batches = partition(Vec::new(), 10);
        assert!(batches.is_empty());
    }

    #[test]
    fn test_render_batch_prompt_lists_every_fixture() {
        let fixtures = vec![fixture("fix-1"), fixture("fix-2")];
        let prompt = render_batch_prompt(&fixtures).expect("template renders");

        assert!(prompt.contains("fixture_id: fix-1"));
        assert!(prompt.contains("fixture_id: fix-2"));
        assert!(prompt.contains("Arsenal vs Chelsea"));
        assert!(prompt.contains("Return exactly 2 elements"));
    }

    #[test]
    fn test_render_batch_prompt_includes_analysis() {
        let fixtures = vec![fixture("fix-1")
            .with_analysis(serde_json::json!({"home_form": "WWDLW", "away_form": "LLDWW"}))];
        let prompt = render_batch_prompt(&fixtures).expect("template renders");
        assert!(prompt.contains("home_form"));
    }

    #[test]
    fn test_build_batches_renders_one_prompt_per_batch() {
        let fixtures: Vec<_> = (0..12).map(|i| fixture(&format!("f{}", i))).collect();
        let batches = build_batches(fixtures, 10).expect("batches build");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].index, 0);
        assert_eq!(batches[1].index, 1);
        assert!(batches[0].prompt.contains("fixture_id: f0"));
        assert!(batches[1].prompt.contains("fixture_id: f10"));
        assert_eq!(batches[1].fixture_ids(), vec!["f10", "f11"]);
    }

    #[test]
    fn test_fixture_serde_roundtrip() {
        let f = fixture("f1").with_analysis(serde_json::json!({"k": 1}));
        let json = serde_json::to_string(&f).expect("serializes");
        let parsed: Fixture = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(parsed, f);
    }
}
