//! Schema migrations.
//!
//! Migrations are embedded SQL applied in order and tracked in a
//! `schema_migrations` table. Each migration runs in its own transaction
//! and is recorded atomically with its effects.

use sqlx::PgPool;

use super::StoreError;

/// An embedded migration.
struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_providers",
        sql: r#"
            CREATE TABLE IF NOT EXISTS providers (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                model TEXT NOT NULL,
                base_url TEXT NOT NULL,
                api_key_env TEXT NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                auto_disabled BOOLEAN NOT NULL DEFAULT FALSE,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                cost_per_1m_input DOUBLE PRECISION NOT NULL,
                cost_per_1m_output DOUBLE PRECISION NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
        "#,
    },
    Migration {
        version: 2,
        name: "create_fixtures",
        sql: r#"
            CREATE TABLE IF NOT EXISTS fixtures (
                id TEXT PRIMARY KEY,
                home TEXT NOT NULL,
                away TEXT NOT NULL,
                competition TEXT NOT NULL,
                kickoff TIMESTAMPTZ NOT NULL,
                analysis JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_fixtures_kickoff ON fixtures (kickoff)
        "#,
    },
    Migration {
        version: 3,
        name: "create_prediction_records",
        sql: r#"
            CREATE TABLE IF NOT EXISTS prediction_records (
                id UUID PRIMARY KEY,
                fixture_id TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                home_score INTEGER NOT NULL,
                away_score INTEGER NOT NULL,
                confidence DOUBLE PRECISION NOT NULL,
                latency_ms BIGINT NOT NULL,
                raw_response TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (fixture_id, provider_id)
            );
            CREATE INDEX IF NOT EXISTS idx_predictions_fixture ON prediction_records (fixture_id)
        "#,
    },
    Migration {
        version: 4,
        name: "create_budget_ledger",
        sql: r#"
            CREATE TABLE IF NOT EXISTS budget_ledger (
                id BIGSERIAL PRIMARY KEY,
                provider_id TEXT NOT NULL,
                day DATE NOT NULL,
                cost_cents BIGINT NOT NULL,
                attempt INTEGER NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_budget_ledger_day ON budget_ledger (day, provider_id)
        "#,
    },
];

/// Applies embedded migrations in version order.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all unapplied migrations. Idempotent.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        for migration in MIGRATIONS {
            if self.is_applied(migration.version).await? {
                continue;
            }

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?;

            // Statements within one migration are separated by semicolons;
            // run them individually since sqlx prepares single statements.
            for statement in migration.sql.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        StoreError::Migration(format!(
                            "migration {} ({}) failed: {}",
                            migration.version, migration.name, e
                        ))
                    })?;
            }

            sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
                .bind(migration.version)
                .bind(migration.name)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?;

            tx.commit()
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?;

            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applied migration"
            );
        }

        Ok(())
    }

    async fn is_applied(&self, version: i32) -> Result<bool, StoreError> {
        let applied: Option<(i32,)> =
            sqlx::query_as("SELECT version FROM schema_migrations WHERE version = $1")
                .bind(version)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(applied.is_some())
    }
}
