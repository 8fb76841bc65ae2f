//! Queue job definitions.
//!
//! Jobs are small serializable envelopes stored in Redis. The payload is
//! a [`JobKind`] naming which pipeline operation to run; the heavy state
//! (fixtures, providers) lives in the database and is loaded by the
//! worker at execution time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of attempts before a job is dead-lettered.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// The operation a job asks a worker to perform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Run forecast generation. An empty id list means "all currently
    /// ready fixtures"; a non-empty list pins the job to those fixtures.
    Generate {
        #[serde(default)]
        fixture_ids: Vec<String>,
    },
    /// Check worker liveness and stalled jobs, alerting when unhealthy.
    WorkerHealthCheck,
    /// Scan for fixtures past the completeness window without predictions.
    CompletenessCheck,
}

impl JobKind {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::Generate { .. } => "generate",
            JobKind::WorkerHealthCheck => "worker_health_check",
            JobKind::CompletenessCheck => "completeness_check",
        }
    }
}

/// One unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub created_at: DateTime<Utc>,
    /// Number of times this job has been attempted.
    pub attempts: u32,
    /// Attempts allowed before the job is dead-lettered.
    pub max_attempts: u32,
}

impl Job {
    pub fn new(kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// A generation job over all currently ready fixtures.
    pub fn generate_ready() -> Self {
        Self::new(JobKind::Generate {
            fixture_ids: Vec::new(),
        })
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Called before each execution attempt.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Status of a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Failed,
    Timeout,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Outcome reported by a worker after processing a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Predictions created, for generation jobs.
    #[serde(default)]
    pub predictions: Option<usize>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub worker_id: String,
    pub duration_ms: u64,
}

impl JobResult {
    pub fn success(job_id: Uuid, worker_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            job_id,
            status: JobStatus::Completed,
            predictions: None,
            error: None,
            completed_at: Utc::now(),
            worker_id: worker_id.into(),
            duration_ms,
        }
    }

    pub fn with_predictions(mut self, predictions: usize) -> Self {
        self.predictions = Some(predictions);
        self
    }

    pub fn failure(
        job_id: Uuid,
        worker_id: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            predictions: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
            worker_id: worker_id.into(),
            duration_ms,
        }
    }

    pub fn timeout(job_id: Uuid, worker_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            job_id,
            status: JobStatus::Timeout,
            predictions: None,
            error: Some("Job execution timed out".to_string()),
            completed_at: Utc::now(),
            worker_id: worker_id.into(),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}
