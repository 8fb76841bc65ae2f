//! Persistent storage behind an injected trait.
//!
//! The pipeline owns three persisted shapes: provider records (read for
//! eligibility, written for health), append-only prediction records, and
//! the budget ledger. Fixtures are read-only upstream data. Everything
//! goes through the [`Store`] trait so orchestrator and monitors can be
//! exercised against the in-memory implementation without Postgres.

pub mod database;
pub mod memory;
pub mod migrations;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::fixtures::Fixture;
use crate::providers::{Forecast, ProviderRecord};

pub use database::Database;
pub use memory::MemoryStore;
pub use migrations::MigrationRunner;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Insert refused because the (fixture, provider) pair already has a
    /// prediction. Append-only table, duplicates prevented upstream.
    #[error("Prediction already exists for fixture '{fixture_id}' and provider '{provider_id}'")]
    DuplicatePrediction {
        fixture_id: String,
        provider_id: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),
}

/// One persisted forecast for one (fixture, provider) pair.
///
/// Created once per successful sub-result, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: Uuid,
    pub fixture_id: String,
    pub provider_id: String,
    #[serde(flatten)]
    pub forecast: Forecast,
    /// Wall time of the provider call that produced this record.
    pub latency_ms: u64,
    /// Raw provider response retained for provenance.
    pub raw_response: String,
    pub created_at: DateTime<Utc>,
}

impl PredictionRecord {
    pub fn new(
        fixture_id: impl Into<String>,
        provider_id: impl Into<String>,
        forecast: Forecast,
        latency_ms: u64,
        raw_response: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            fixture_id: fixture_id.into(),
            provider_id: provider_id.into(),
            forecast,
            latency_ms,
            raw_response: raw_response.into(),
            created_at: Utc::now(),
        }
    }
}

/// One appended cost row: exactly one per call attempt, failed attempts
/// included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLedgerEntry {
    pub provider_id: String,
    pub day: NaiveDate,
    pub cost_cents: u64,
    /// 1-based attempt number within the call (1 = initial).
    pub attempt: u32,
    pub recorded_at: DateTime<Utc>,
}

impl BudgetLedgerEntry {
    pub fn new(provider_id: impl Into<String>, cost_cents: u64, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            provider_id: provider_id.into(),
            day: now.date_naive(),
            cost_cents,
            attempt,
            recorded_at: now,
        }
    }
}

/// Result of a completeness scan.
#[derive(Debug, Clone)]
pub struct MissingPredictions {
    /// Total fixtures lacking any prediction past the window.
    pub missing_count: u64,
    /// Bounded sample of affected fixture ids.
    pub sample_ids: Vec<String>,
}

/// Persistence seam for the pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    /// All registered providers, active or not.
    async fn list_providers(&self) -> Result<Vec<ProviderRecord>, StoreError>;

    /// Writes a provider's health fields after a run.
    async fn update_provider_health(
        &self,
        provider_id: &str,
        consecutive_failures: u32,
        auto_disabled: bool,
    ) -> Result<(), StoreError>;

    /// Fixtures ready for forecast generation, soonest kickoff first.
    async fn load_ready_fixtures(&self, limit: i64) -> Result<Vec<Fixture>, StoreError>;

    /// Fixtures by id, for jobs that carry an explicit id list.
    async fn load_fixtures(&self, ids: &[String]) -> Result<Vec<Fixture>, StoreError>;

    /// The subset of `fixture_ids` that already have a prediction from
    /// `provider_id`. Used to skip already-predicted pairs before dispatch.
    async fn predicted_fixture_ids(
        &self,
        fixture_ids: &[String],
        provider_id: &str,
    ) -> Result<HashSet<String>, StoreError>;

    /// Appends one prediction. Fails with [`StoreError::DuplicatePrediction`]
    /// on an existing (fixture, provider) pair.
    async fn insert_prediction(&self, record: &PredictionRecord) -> Result<(), StoreError>;

    /// Appends one budget ledger row.
    async fn append_budget_entry(&self, entry: &BudgetLedgerEntry) -> Result<(), StoreError>;

    /// Today's cumulative spend in cents per provider, for seeding the
    /// in-memory tracker on startup.
    async fn budget_spent_today(&self) -> Result<HashMap<String, u64>, StoreError>;

    /// Fixtures that kicked off before `finished_before` and still have
    /// no prediction from any provider.
    async fn fixtures_missing_predictions(
        &self,
        finished_before: DateTime<Utc>,
        sample_limit: usize,
    ) -> Result<MissingPredictions, StoreError>;
}
