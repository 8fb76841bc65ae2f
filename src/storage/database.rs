//! PostgreSQL implementation of the [`Store`] trait.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::fixtures::Fixture;
use crate::providers::ProviderRecord;

use super::migrations::MigrationRunner;
use super::{BudgetLedgerEntry, MissingPredictions, PredictionRecord, Store, StoreError};

/// Postgres error code for unique constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL database client.
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to the database.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a client from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs schema migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        MigrationRunner::new(self.pool.clone()).run_migrations().await
    }

    /// Inserts or updates a provider registration. Health fields are left
    /// untouched on conflict; those are owned by the health tracker.
    pub async fn upsert_provider(&self, provider: &ProviderRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO providers (
                id, display_name, model, base_url, api_key_env, active,
                auto_disabled, consecutive_failures, cost_per_1m_input, cost_per_1m_output
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                model = EXCLUDED.model,
                base_url = EXCLUDED.base_url,
                api_key_env = EXCLUDED.api_key_env,
                active = EXCLUDED.active,
                cost_per_1m_input = EXCLUDED.cost_per_1m_input,
                cost_per_1m_output = EXCLUDED.cost_per_1m_output,
                updated_at = NOW()
            "#,
        )
        .bind(&provider.id)
        .bind(&provider.display_name)
        .bind(&provider.model)
        .bind(&provider.base_url)
        .bind(&provider.api_key_env)
        .bind(provider.active)
        .bind(provider.auto_disabled)
        .bind(provider.consecutive_failures as i32)
        .bind(provider.cost_per_1m_input)
        .bind(provider.cost_per_1m_output)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl Store for Database {
    async fn list_providers(&self) -> Result<Vec<ProviderRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, display_name, model, base_url, api_key_env, active,
                   auto_disabled, consecutive_failures, cost_per_1m_input, cost_per_1m_output
            FROM providers
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| ProviderRecord {
                id: row.get("id"),
                display_name: row.get("display_name"),
                model: row.get("model"),
                base_url: row.get("base_url"),
                api_key_env: row.get("api_key_env"),
                active: row.get("active"),
                auto_disabled: row.get("auto_disabled"),
                consecutive_failures: row.get::<i32, _>("consecutive_failures") as u32,
                cost_per_1m_input: row.get("cost_per_1m_input"),
                cost_per_1m_output: row.get("cost_per_1m_output"),
            })
            .collect())
    }

    async fn update_provider_health(
        &self,
        provider_id: &str,
        consecutive_failures: u32,
        auto_disabled: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE providers
            SET consecutive_failures = $2, auto_disabled = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(provider_id)
        .bind(consecutive_failures as i32)
        .bind(auto_disabled)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        Ok(())
    }

    async fn load_ready_fixtures(&self, limit: i64) -> Result<Vec<Fixture>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, home, away, competition, kickoff, analysis
            FROM fixtures
            WHERE kickoff > NOW()
            ORDER BY kickoff ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        Ok(rows.into_iter().map(fixture_from_row).collect())
    }

    async fn load_fixtures(&self, ids: &[String]) -> Result<Vec<Fixture>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, home, away, competition, kickoff, analysis
            FROM fixtures
            WHERE id = ANY($1)
            ORDER BY kickoff ASC
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        Ok(rows.into_iter().map(fixture_from_row).collect())
    }

    async fn predicted_fixture_ids(
        &self,
        fixture_ids: &[String],
        provider_id: &str,
    ) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT fixture_id FROM prediction_records
            WHERE provider_id = $1 AND fixture_id = ANY($2)
            "#,
        )
        .bind(provider_id)
        .bind(fixture_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        Ok(rows.into_iter().map(|row| row.get("fixture_id")).collect())
    }

    async fn insert_prediction(&self, record: &PredictionRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO prediction_records (
                id, fixture_id, provider_id, outcome, home_score, away_score,
                confidence, latency_ms, raw_response, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(&record.fixture_id)
        .bind(&record.provider_id)
        .bind(record.forecast.outcome.to_string())
        .bind(record.forecast.home_score as i32)
        .bind(record.forecast.away_score as i32)
        .bind(record.forecast.confidence)
        .bind(record.latency_ms as i64)
        .bind(&record.raw_response)
        .bind(record.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(StoreError::DuplicatePrediction {
                    fixture_id: record.fixture_id.clone(),
                    provider_id: record.provider_id.clone(),
                })
            }
            Err(e) => Err(StoreError::QueryFailed(e.to_string())),
        }
    }

    async fn append_budget_entry(&self, entry: &BudgetLedgerEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO budget_ledger (provider_id, day, cost_cents, attempt, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&entry.provider_id)
        .bind(entry.day)
        .bind(entry.cost_cents as i64)
        .bind(entry.attempt as i32)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        Ok(())
    }

    async fn budget_spent_today(&self) -> Result<HashMap<String, u64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT provider_id, COALESCE(SUM(cost_cents), 0) AS spent
            FROM budget_ledger
            WHERE day = CURRENT_DATE
            GROUP BY provider_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let provider_id: String = row.get("provider_id");
                let spent: i64 = row.get("spent");
                (provider_id, spent.max(0) as u64)
            })
            .collect())
    }

    async fn fixtures_missing_predictions(
        &self,
        finished_before: DateTime<Utc>,
        sample_limit: usize,
    ) -> Result<MissingPredictions, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS missing FROM fixtures f
            WHERE f.kickoff < $1
              AND NOT EXISTS (
                  SELECT 1 FROM prediction_records p WHERE p.fixture_id = f.id
              )
            "#,
        )
        .bind(finished_before)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        let missing_count: i64 = row.get("missing");

        let sample_rows = sqlx::query(
            r#"
            SELECT f.id FROM fixtures f
            WHERE f.kickoff < $1
              AND NOT EXISTS (
                  SELECT 1 FROM prediction_records p WHERE p.fixture_id = f.id
              )
            ORDER BY f.kickoff ASC
            LIMIT $2
            "#,
        )
        .bind(finished_before)
        .bind(sample_limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        Ok(MissingPredictions {
            missing_count: missing_count.max(0) as u64,
            sample_ids: sample_rows.into_iter().map(|row| row.get("id")).collect(),
        })
    }
}

fn fixture_from_row(row: sqlx::postgres::PgRow) -> Fixture {
    Fixture {
        id: row.get("id"),
        home: row.get("home"),
        away: row.get("away"),
        competition: row.get("competition"),
        kickoff: row.get("kickoff"),
        analysis: row.get("analysis"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::DuplicatePrediction {
            fixture_id: "f1".into(),
            provider_id: "p1".into(),
        };
        assert!(err.to_string().contains("f1"));
        assert!(err.to_string().contains("p1"));
    }
}
