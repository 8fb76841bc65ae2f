//! Content completeness scanning.
//!
//! Catches the failure mode where the pipeline runs without errors but
//! certain fixtures never receive a prediction from any provider, for
//! example after repeated budget skips or upstream id mismatches.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alerts::{Alert, AlertSink};
use crate::storage::{Store, StoreError};

/// Result of one completeness scan.
#[derive(Debug, Clone, Serialize)]
pub struct CompletenessReport {
    pub complete: bool,
    /// Fixtures that kicked off before the cutoff without any prediction.
    pub missing_count: u64,
    /// Bounded sample of affected fixture ids for the alert.
    pub sample_ids: Vec<String>,
    pub cutoff: DateTime<Utc>,
    pub checked_at: DateTime<Utc>,
}

/// Scans for fixtures past the completeness window with no predictions.
pub struct CompletenessMonitor {
    store: Arc<dyn Store>,
    window: Duration,
    sample_size: usize,
    alerts: Arc<dyn AlertSink>,
}

impl CompletenessMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        window: Duration,
        sample_size: usize,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            window,
            sample_size,
            alerts,
        }
    }

    /// Runs one scan, alerting at warning severity when fixtures are
    /// missing predictions.
    pub async fn check(&self) -> Result<CompletenessReport, StoreError> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(self.window)
                .unwrap_or_else(|_| chrono::Duration::hours(24));

        let missing = self
            .store
            .fixtures_missing_predictions(cutoff, self.sample_size)
            .await?;

        let report = CompletenessReport {
            complete: missing.missing_count == 0,
            missing_count: missing.missing_count,
            sample_ids: missing.sample_ids,
            cutoff,
            checked_at: now,
        };

        if report.complete {
            tracing::debug!(cutoff = %cutoff, "Completeness scan found no gaps");
        } else {
            tracing::warn!(
                missing_count = report.missing_count,
                sample = ?report.sample_ids,
                cutoff = %cutoff,
                "Fixtures past the completeness window have no predictions"
            );
            self.alerts
                .send(
                    Alert::warning(
                        "Fixtures missing predictions",
                        format!(
                            "{} fixture(s) older than the completeness window have no prediction from any provider",
                            report.missing_count
                        ),
                    )
                    .with_field("missing_count", report.missing_count)
                    .with_field("sample_fixture_ids", &report.sample_ids)
                    .with_field("cutoff", cutoff.to_rfc3339()),
                )
                .await;
        }

        Ok(report)
    }
}
