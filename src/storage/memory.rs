//! In-memory implementation of the [`Store`] trait.
//!
//! Backs the test suites. Behavior mirrors the Postgres implementation,
//! including duplicate-prediction rejection and the daily ledger
//! aggregation.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::fixtures::Fixture;
use crate::providers::ProviderRecord;

use super::{BudgetLedgerEntry, MissingPredictions, PredictionRecord, Store, StoreError};

#[derive(Default)]
struct Inner {
    providers: Vec<ProviderRecord>,
    fixtures: Vec<Fixture>,
    predictions: Vec<PredictionRecord>,
    ledger: Vec<BudgetLedgerEntry>,
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider.
    pub fn add_provider(&self, provider: ProviderRecord) {
        self.inner.lock().expect("store lock").providers.push(provider);
    }

    /// Inserts fixtures as upstream would.
    pub fn add_fixtures(&self, fixtures: Vec<Fixture>) {
        self.inner.lock().expect("store lock").fixtures.extend(fixtures);
    }

    /// All predictions written so far.
    pub fn predictions(&self) -> Vec<PredictionRecord> {
        self.inner.lock().expect("store lock").predictions.clone()
    }

    /// All ledger rows written so far.
    pub fn ledger(&self) -> Vec<BudgetLedgerEntry> {
        self.inner.lock().expect("store lock").ledger.clone()
    }

    /// Ledger rows for one provider.
    pub fn ledger_for(&self, provider_id: &str) -> Vec<BudgetLedgerEntry> {
        self.inner
            .lock()
            .expect("store lock")
            .ledger
            .iter()
            .filter(|e| e.provider_id == provider_id)
            .cloned()
            .collect()
    }

    /// Current persisted health fields for one provider.
    pub fn provider(&self, provider_id: &str) -> Option<ProviderRecord> {
        self.inner
            .lock()
            .expect("store lock")
            .providers
            .iter()
            .find(|p| p.id == provider_id)
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_providers(&self) -> Result<Vec<ProviderRecord>, StoreError> {
        Ok(self.inner.lock().expect("store lock").providers.clone())
    }

    async fn update_provider_health(
        &self,
        provider_id: &str,
        consecutive_failures: u32,
        auto_disabled: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(provider) = inner.providers.iter_mut().find(|p| p.id == provider_id) {
            provider.consecutive_failures = consecutive_failures;
            provider.auto_disabled = auto_disabled;
        }
        Ok(())
    }

    async fn load_ready_fixtures(&self, limit: i64) -> Result<Vec<Fixture>, StoreError> {
        let now = Utc::now();
        let mut ready: Vec<Fixture> = self
            .inner
            .lock()
            .expect("store lock")
            .fixtures
            .iter()
            .filter(|f| f.kickoff > now)
            .cloned()
            .collect();
        ready.sort_by_key(|f| f.kickoff);
        ready.truncate(limit.max(0) as usize);
        Ok(ready)
    }

    async fn load_fixtures(&self, ids: &[String]) -> Result<Vec<Fixture>, StoreError> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut fixtures: Vec<Fixture> = self
            .inner
            .lock()
            .expect("store lock")
            .fixtures
            .iter()
            .filter(|f| wanted.contains(f.id.as_str()))
            .cloned()
            .collect();
        fixtures.sort_by_key(|f| f.kickoff);
        Ok(fixtures)
    }

    async fn predicted_fixture_ids(
        &self,
        fixture_ids: &[String],
        provider_id: &str,
    ) -> Result<HashSet<String>, StoreError> {
        let wanted: HashSet<&str> = fixture_ids.iter().map(String::as_str).collect();
        Ok(self
            .inner
            .lock()
            .expect("store lock")
            .predictions
            .iter()
            .filter(|p| p.provider_id == provider_id && wanted.contains(p.fixture_id.as_str()))
            .map(|p| p.fixture_id.clone())
            .collect())
    }

    async fn insert_prediction(&self, record: &PredictionRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let exists = inner
            .predictions
            .iter()
            .any(|p| p.fixture_id == record.fixture_id && p.provider_id == record.provider_id);
        if exists {
            return Err(StoreError::DuplicatePrediction {
                fixture_id: record.fixture_id.clone(),
                provider_id: record.provider_id.clone(),
            });
        }
        inner.predictions.push(record.clone());
        Ok(())
    }

    async fn append_budget_entry(&self, entry: &BudgetLedgerEntry) -> Result<(), StoreError> {
        self.inner.lock().expect("store lock").ledger.push(entry.clone());
        Ok(())
    }

    async fn budget_spent_today(&self) -> Result<HashMap<String, u64>, StoreError> {
        let today = Utc::now().date_naive();
        let mut spent: HashMap<String, u64> = HashMap::new();
        for entry in &self.inner.lock().expect("store lock").ledger {
            if entry.day == today {
                *spent.entry(entry.provider_id.clone()).or_insert(0) += entry.cost_cents;
            }
        }
        Ok(spent)
    }

    async fn fixtures_missing_predictions(
        &self,
        finished_before: DateTime<Utc>,
        sample_limit: usize,
    ) -> Result<MissingPredictions, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        let predicted: HashSet<&str> = inner
            .predictions
            .iter()
            .map(|p| p.fixture_id.as_str())
            .collect();

        let mut missing: Vec<&Fixture> = inner
            .fixtures
            .iter()
            .filter(|f| f.kickoff < finished_before && !predicted.contains(f.id.as_str()))
            .collect();
        missing.sort_by_key(|f| f.kickoff);

        Ok(MissingPredictions {
            missing_count: missing.len() as u64,
            sample_ids: missing
                .into_iter()
                .take(sample_limit)
                .map(|f| f.id.clone())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Forecast, Outcome};
    use chrono::Duration;

    fn fixture_at(id: &str, kickoff: DateTime<Utc>) -> Fixture {
        Fixture::new(id, "Home FC", "Away FC", "League", kickoff)
    }

    fn record(fixture: &str, provider: &str) -> PredictionRecord {
        PredictionRecord::new(
            fixture,
            provider,
            Forecast {
                outcome: Outcome::Draw,
                home_score: 1,
                away_score: 1,
                confidence: 0.5,
            },
            120,
            "[]",
        )
    }

    #[tokio::test]
    async fn test_duplicate_prediction_rejected() {
        let store = MemoryStore::new();
        store.insert_prediction(&record("f1", "p1")).await.expect("first insert");

        let err = store.insert_prediction(&record("f1", "p1")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicatePrediction { .. }));

        // Different provider for the same fixture is fine.
        store.insert_prediction(&record("f1", "p2")).await.expect("other pair");
        assert_eq!(store.predictions().len(), 2);
    }

    #[tokio::test]
    async fn test_predicted_fixture_ids_filters_by_provider() {
        let store = MemoryStore::new();
        store.insert_prediction(&record("f1", "p1")).await.expect("insert");
        store.insert_prediction(&record("f2", "p2")).await.expect("insert");

        let ids = vec!["f1".to_string(), "f2".to_string()];
        let predicted = store.predicted_fixture_ids(&ids, "p1").await.expect("query");
        assert!(predicted.contains("f1"));
        assert!(!predicted.contains("f2"));
    }

    #[tokio::test]
    async fn test_ready_fixtures_excludes_past_kickoffs() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.add_fixtures(vec![
            fixture_at("past", now - Duration::hours(2)),
            fixture_at("soon", now + Duration::hours(1)),
            fixture_at("later", now + Duration::hours(4)),
        ]);

        let ready = store.load_ready_fixtures(10).await.expect("query");
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].id, "soon");
        assert_eq!(ready[1].id, "later");
    }

    #[tokio::test]
    async fn test_missing_predictions_scan() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.add_fixtures(vec![
            fixture_at("old-missing", now - Duration::hours(30)),
            fixture_at("old-covered", now - Duration::hours(30)),
            fixture_at("recent", now - Duration::hours(1)),
        ]);
        store
            .insert_prediction(&record("old-covered", "p1"))
            .await
            .expect("insert");

        let cutoff = now - Duration::hours(24);
        let missing = store
            .fixtures_missing_predictions(cutoff, 5)
            .await
            .expect("scan");
        assert_eq!(missing.missing_count, 1);
        assert_eq!(missing.sample_ids, vec!["old-missing"]);
    }

    #[tokio::test]
    async fn test_budget_spent_today_aggregates() {
        let store = MemoryStore::new();
        store
            .append_budget_entry(&BudgetLedgerEntry::new("p1", 100, 1))
            .await
            .expect("append");
        store
            .append_budget_entry(&BudgetLedgerEntry::new("p1", 50, 2))
            .await
            .expect("append");
        store
            .append_budget_entry(&BudgetLedgerEntry::new("p2", 25, 1))
            .await
            .expect("append");

        let spent = store.budget_spent_today().await.expect("query");
        assert_eq!(spent["p1"], 150);
        assert_eq!(spent["p2"], 25);
    }
}
