//! Worker liveness and stall detection.
//!
//! A queue with a growing backlog and no live workers fails silently:
//! jobs are accepted and never run. This check combines two signals
//! from Redis - worker heartbeats and per-job processing start times -
//! into one health verdict.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alerts::{Alert, AlertSink};
use crate::scheduler::queue::{QueueError, QueueInspect};

/// A heartbeat older than this means the worker is gone, not just busy.
const HEARTBEAT_TTL_SECS: i64 = 60;

/// At most this many stalled job ids are attached to an alert.
const STALLED_ID_SAMPLE: usize = 10;

/// One health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub live_workers: usize,
    pub pending_jobs: usize,
    pub processing_jobs: usize,
    pub stalled_jobs: usize,
    /// Age in seconds of the longest-running stalled job, if any.
    pub oldest_stall_secs: Option<u64>,
    pub checked_at: DateTime<Utc>,
}

/// The health rule itself, separated from the Redis plumbing.
///
/// A live worker means stalled jobs are being worked through, however
/// slowly; no workers plus a stall means nobody will ever finish them.
fn evaluate(live_workers: usize, stalled_jobs: usize) -> bool {
    live_workers > 0 || stalled_jobs == 0
}

/// Periodic worker health check.
pub struct WorkerHealthMonitor {
    queue: Arc<dyn QueueInspect>,
    stall_threshold: Duration,
    alerts: Arc<dyn AlertSink>,
}

impl WorkerHealthMonitor {
    pub fn new(
        queue: Arc<dyn QueueInspect>,
        stall_threshold: Duration,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            queue,
            stall_threshold,
            alerts,
        }
    }

    /// Runs one health check, alerting at error severity when unhealthy.
    pub async fn check(&self) -> Result<HealthSnapshot, QueueError> {
        let now = Utc::now();

        let heartbeats = self.queue.worker_heartbeats().await?;
        let live_workers = heartbeats
            .values()
            .filter(|last| (now - **last).num_seconds() <= HEARTBEAT_TTL_SECS)
            .count();

        let stalled = self.queue.stalled_jobs(self.stall_threshold).await?;
        let oldest_stall_secs = stalled
            .iter()
            .map(|(_, started)| (now - *started).num_seconds().max(0) as u64)
            .max();

        let stats = self.queue.stats().await?;
        let healthy = evaluate(live_workers, stalled.len());

        let snapshot = HealthSnapshot {
            healthy,
            live_workers,
            pending_jobs: stats.pending_jobs,
            processing_jobs: stats.processing_jobs,
            stalled_jobs: stalled.len(),
            oldest_stall_secs,
            checked_at: now,
        };

        if healthy {
            tracing::debug!(
                live_workers = live_workers,
                pending_jobs = stats.pending_jobs,
                "Worker health check passed"
            );
        } else {
            tracing::error!(
                live_workers = live_workers,
                stalled_jobs = snapshot.stalled_jobs,
                oldest_stall_secs = oldest_stall_secs.unwrap_or(0),
                "Worker health check failed: stalled jobs with no live workers"
            );
            let stalled_job_ids: Vec<&str> = stalled
                .iter()
                .take(STALLED_ID_SAMPLE)
                .map(|(id, _)| id.as_str())
                .collect();
            self.alerts
                .send(
                    Alert::error(
                        "Generation workers unhealthy",
                        "Jobs are stalled in the processing queue and no live workers are attached",
                    )
                    .with_field("live_workers", live_workers)
                    .with_field("stalled_jobs", snapshot.stalled_jobs)
                    .with_field("stalled_job_ids", stalled_job_ids)
                    .with_field("pending_jobs", stats.pending_jobs)
                    .with_field("oldest_stall_secs", oldest_stall_secs.unwrap_or(0)),
                )
                .await;
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::alerts::tests::CapturingSink;
    use crate::alerts::Severity;
    use crate::scheduler::queue::QueueStats;

    struct FakeQueue {
        heartbeats: Mutex<HashMap<String, DateTime<Utc>>>,
        stalled: Mutex<Vec<(String, DateTime<Utc>)>>,
        pending: usize,
    }

    impl FakeQueue {
        fn new() -> Self {
            Self {
                heartbeats: Mutex::new(HashMap::new()),
                stalled: Mutex::new(Vec::new()),
                pending: 0,
            }
        }

        fn with_worker(self, id: &str, last_seen: DateTime<Utc>) -> Self {
            self.heartbeats
                .lock()
                .expect("heartbeats lock")
                .insert(id.to_string(), last_seen);
            self
        }

        fn with_stalled(self, job_id: &str, started: DateTime<Utc>) -> Self {
            self.stalled
                .lock()
                .expect("stalled lock")
                .push((job_id.to_string(), started));
            self
        }
    }

    #[async_trait]
    impl QueueInspect for FakeQueue {
        async fn worker_heartbeats(&self) -> Result<HashMap<String, DateTime<Utc>>, QueueError> {
            Ok(self.heartbeats.lock().expect("heartbeats lock").clone())
        }

        async fn stalled_jobs(
            &self,
            _threshold: Duration,
        ) -> Result<Vec<(String, DateTime<Utc>)>, QueueError> {
            Ok(self.stalled.lock().expect("stalled lock").clone())
        }

        async fn stats(&self) -> Result<QueueStats, QueueError> {
            Ok(QueueStats {
                queue_name: "generation".to_string(),
                pending_jobs: self.pending,
                processing_jobs: self.stalled.lock().expect("stalled lock").len(),
                dead_letter_jobs: 0,
                paused: false,
            })
        }
    }

    fn monitor(queue: FakeQueue) -> (WorkerHealthMonitor, Arc<CapturingSink>) {
        let alerts = Arc::new(CapturingSink::new());
        let monitor = WorkerHealthMonitor::new(
            Arc::new(queue),
            Duration::from_secs(300),
            Arc::clone(&alerts) as Arc<dyn AlertSink>,
        );
        (monitor, alerts)
    }

    #[test]
    fn test_health_rule() {
        assert!(evaluate(1, 0));
        assert!(evaluate(1, 3));
        assert!(evaluate(0, 0));
        assert!(!evaluate(0, 1));
    }

    #[tokio::test]
    async fn test_healthy_with_live_worker_and_stall() {
        let queue = FakeQueue::new()
            .with_worker("worker-0", Utc::now())
            .with_stalled("job-1", Utc::now() - chrono::Duration::minutes(10));
        let (monitor, alerts) = monitor(queue);

        let snapshot = monitor.check().await.expect("check runs");
        assert!(snapshot.healthy);
        assert_eq!(snapshot.live_workers, 1);
        assert_eq!(snapshot.stalled_jobs, 1);
        assert!(alerts.alerts.lock().expect("alerts lock").is_empty());
    }

    #[tokio::test]
    async fn test_unhealthy_without_workers() {
        let queue = FakeQueue::new()
            .with_stalled("job-1", Utc::now() - chrono::Duration::minutes(10));
        let (monitor, alerts) = monitor(queue);

        let snapshot = monitor.check().await.expect("check runs");
        assert!(!snapshot.healthy);
        assert_eq!(snapshot.live_workers, 0);
        assert!(snapshot.oldest_stall_secs.expect("stall age") >= 590);

        let sent = alerts.alerts.lock().expect("alerts lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Error);
        assert_eq!(sent[0].fields["live_workers"], 0);
        assert_eq!(
            sent[0].fields["stalled_job_ids"],
            serde_json::json!(["job-1"])
        );
    }

    #[tokio::test]
    async fn test_alert_bounds_stalled_job_ids() {
        let mut queue = FakeQueue::new();
        for i in 0..STALLED_ID_SAMPLE + 5 {
            queue = queue.with_stalled(
                &format!("job-{}", i),
                Utc::now() - chrono::Duration::minutes(10),
            );
        }
        let (monitor, alerts) = monitor(queue);

        let snapshot = monitor.check().await.expect("check runs");
        assert_eq!(snapshot.stalled_jobs, STALLED_ID_SAMPLE + 5);

        let sent = alerts.alerts.lock().expect("alerts lock");
        let ids = sent[0].fields["stalled_job_ids"]
            .as_array()
            .expect("id sample");
        assert_eq!(ids.len(), STALLED_ID_SAMPLE);
        assert_eq!(sent[0].fields["stalled_jobs"], STALLED_ID_SAMPLE + 5);
    }

    #[tokio::test]
    async fn test_stale_heartbeat_does_not_count() {
        let queue = FakeQueue::new()
            .with_worker("worker-0", Utc::now() - chrono::Duration::minutes(5))
            .with_stalled("job-1", Utc::now() - chrono::Duration::minutes(10));
        let (monitor, _alerts) = monitor(queue);

        let snapshot = monitor.check().await.expect("check runs");
        assert_eq!(snapshot.live_workers, 0);
        assert!(!snapshot.healthy);
    }

    #[tokio::test]
    async fn test_idle_queue_with_no_workers_is_healthy() {
        let (monitor, alerts) = monitor(FakeQueue::new());

        let snapshot = monitor.check().await.expect("check runs");
        assert!(snapshot.healthy);
        assert_eq!(snapshot.stalled_jobs, 0);
        assert!(alerts.alerts.lock().expect("alerts lock").is_empty());
    }
}
