//! Redis-based job queue with reliable dequeue.
//!
//! The queue is a set of Redis keys prefixed with the queue name:
//!
//! - `{queue_name}`: main list, jobs enqueued with LPUSH
//! - `{queue_name}:processing`: jobs in flight, for crash recovery
//! - `{queue_name}:started`: hash of job id to processing start time
//! - `{queue_name}:dead_letter`: jobs that exhausted their attempts
//! - `{queue_name}:results`: per-job result keys with a TTL
//! - `{queue_name}:paused`: flag key set while the circuit breaker holds
//!   the queue closed
//! - `{queue_name}:workers`: hash of worker id to last heartbeat
//!
//! Dequeue uses BRPOPLPUSH so a job is atomically moved into the
//! processing list; a crashed worker leaves it there for recovery rather
//! than losing it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use uuid::Uuid;

use super::job::{Job, JobResult};

/// Result TTL in seconds (7 days).
const RESULT_TTL_SECS: u64 = 604_800;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// The control surface the circuit breaker needs: pausing and resuming
/// consumption without caring how the queue is implemented.
#[async_trait]
pub trait QueueControl: Send + Sync {
    async fn pause(&self) -> Result<(), QueueError>;
    async fn resume(&self) -> Result<(), QueueError>;
    async fn is_paused(&self) -> Result<bool, QueueError>;
}

/// Read-only view of queue liveness, consumed by the worker health
/// monitor.
#[async_trait]
pub trait QueueInspect: Send + Sync {
    async fn worker_heartbeats(&self) -> Result<HashMap<String, DateTime<Utc>>, QueueError>;
    async fn stalled_jobs(
        &self,
        threshold: Duration,
    ) -> Result<Vec<(String, DateTime<Utc>)>, QueueError>;
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// Redis-backed job queue.
pub struct JobQueue {
    redis: ConnectionManager,
    queue_name: String,
    processing_queue: String,
    started_key: String,
    dead_letter_queue: String,
    results_key: String,
    paused_key: String,
    workers_key: String,
}

impl JobQueue {
    /// Connects to Redis and creates a new job queue.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a queue from an existing connection manager, for sharing
    /// one pool across components.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            processing_queue: format!("{}:processing", queue_name),
            started_key: format!("{}:started", queue_name),
            dead_letter_queue: format!("{}:dead_letter", queue_name),
            results_key: format!("{}:results", queue_name),
            paused_key: format!("{}:paused", queue_name),
            workers_key: format!("{}:workers", queue_name),
        }
    }

    /// Enqueues one job (LPUSH; dequeue pops from the right for FIFO).
    pub async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, serialized).await?;
        Ok(())
    }

    /// Dequeues the next job, blocking until one is available or the
    /// timeout expires.
    ///
    /// BRPOPLPUSH atomically moves the job into the processing list; the
    /// processing start time is recorded for stall detection.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => {
                let job: Job = serde_json::from_str(&data)?;
                conn.hset::<_, _, _, ()>(
                    &self.started_key,
                    job.id.to_string(),
                    Utc::now().to_rfc3339(),
                )
                .await?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Marks a job as finished and stores its result with a TTL.
    pub async fn complete(&self, job_id: Uuid, result: JobResult) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let result_key = format!("{}:{}", self.results_key, job_id);
        let result_data = serde_json::to_string(&result)?;
        conn.set_ex::<_, _, ()>(&result_key, &result_data, RESULT_TTL_SECS)
            .await?;

        self.remove_from_processing(job_id).await?;
        Ok(())
    }

    /// Returns a job to the main queue for another attempt. The caller
    /// increments the attempt counter first.
    pub async fn requeue(&self, job: Job) -> Result<(), QueueError> {
        self.remove_from_processing(job.id).await?;

        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();
        // RPUSH so the retry is next in line rather than behind the backlog.
        conn.rpush::<_, _, ()>(&self.queue_name, serialized).await?;
        Ok(())
    }

    /// Moves a job to the dead letter queue after exhausting attempts.
    pub async fn dead_letter(&self, job: Job, error: &str) -> Result<(), QueueError> {
        self.remove_from_processing(job.id).await?;

        let entry = serde_json::json!({
            "job": job,
            "error": error,
            "moved_at": Utc::now().to_rfc3339(),
        });
        let serialized = serde_json::to_string(&entry)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.dead_letter_queue, serialized)
            .await?;
        Ok(())
    }

    /// Retrieves a stored job result.
    pub async fn get_result(&self, job_id: Uuid) -> Result<Option<JobResult>, QueueError> {
        let mut conn = self.redis.clone();
        let result_key = format!("{}:{}", self.results_key, job_id);
        let data: Option<String> = conn.get(&result_key).await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(&self.queue_name).await?)
    }

    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(&self.processing_queue).await?)
    }

    pub async fn dead_letter_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(&self.dead_letter_queue).await?)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Records a worker heartbeat.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(&self.workers_key, worker_id, Utc::now().to_rfc3339())
            .await?;
        Ok(())
    }

    /// Removes a worker's heartbeat on clean shutdown.
    pub async fn clear_heartbeat(&self, worker_id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.hdel::<_, _, ()>(&self.workers_key, worker_id).await?;
        Ok(())
    }

    /// Last heartbeat per worker. Unparseable entries are dropped.
    pub async fn worker_heartbeats(&self) -> Result<HashMap<String, DateTime<Utc>>, QueueError> {
        let mut conn = self.redis.clone();
        let raw: HashMap<String, String> = conn.hgetall(&self.workers_key).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(worker_id, ts)| {
                DateTime::parse_from_rfc3339(&ts)
                    .ok()
                    .map(|t| (worker_id, t.with_timezone(&Utc)))
            })
            .collect())
    }

    /// Processing start time per in-flight job, for stall detection.
    pub async fn processing_started(&self) -> Result<HashMap<String, DateTime<Utc>>, QueueError> {
        let mut conn = self.redis.clone();
        let raw: HashMap<String, String> = conn.hgetall(&self.started_key).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(job_id, ts)| {
                DateTime::parse_from_rfc3339(&ts)
                    .ok()
                    .map(|t| (job_id, t.with_timezone(&Utc)))
            })
            .collect())
    }

    /// Jobs in flight longer than `threshold`.
    pub async fn stalled_jobs(
        &self,
        threshold: Duration,
    ) -> Result<Vec<(String, DateTime<Utc>)>, QueueError> {
        let started = self.processing_started().await?;
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        Ok(started
            .into_iter()
            .filter(|(_, at)| now - *at > threshold)
            .collect())
    }

    /// Recovers jobs stuck in the processing queue, typically after a
    /// worker crash. Returns how many were requeued.
    pub async fn recover_processing_jobs(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let mut recovered = 0;

        let jobs: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;
        for job_data in jobs {
            let Ok(mut job) = serde_json::from_str::<Job>(&job_data) else {
                continue;
            };
            // Recovery counts as a failed attempt.
            job.increment_attempts();

            if job.should_retry() {
                let serialized = serde_json::to_string(&job)?;
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .lrem(&self.processing_queue, 1, &job_data)
                    .hdel(&self.started_key, job.id.to_string())
                    .rpush(&self.queue_name, &serialized);
                pipe.query_async::<_, ()>(&mut conn).await?;
                recovered += 1;
            } else {
                self.dead_letter(job, "Recovered from processing queue after max attempts")
                    .await?;
            }
        }

        Ok(recovered)
    }

    /// Queue statistics for the status endpoint.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (pending, processing, dead_letter, paused) = tokio::try_join!(
            self.len(),
            self.processing_len(),
            self.dead_letter_len(),
            self.is_paused()
        )?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_jobs: pending,
            processing_jobs: processing,
            dead_letter_jobs: dead_letter,
            paused,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn remove_from_processing(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.hdel::<_, _, ()>(&self.started_key, job_id.to_string())
            .await?;

        let jobs: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;
        for job_data in jobs {
            if let Ok(job) = serde_json::from_str::<Job>(&job_data) {
                if job.id == job_id {
                    conn.lrem::<_, _, ()>(&self.processing_queue, 1, &job_data)
                        .await?;
                    return Ok(());
                }
            }
        }

        // Not found is fine: another path may have removed it already.
        Ok(())
    }
}

#[async_trait]
impl QueueControl for JobQueue {
    /// Sets the pause flag. Workers check it before dequeueing; no TTL,
    /// resuming is the circuit breaker's job.
    async fn pause(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(&self.paused_key, "1").await?;
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(&self.paused_key).await?;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.exists(&self.paused_key).await?)
    }
}

#[async_trait]
impl QueueInspect for JobQueue {
    async fn worker_heartbeats(&self) -> Result<HashMap<String, DateTime<Utc>>, QueueError> {
        JobQueue::worker_heartbeats(self).await
    }

    async fn stalled_jobs(
        &self,
        threshold: Duration,
    ) -> Result<Vec<(String, DateTime<Utc>)>, QueueError> {
        JobQueue::stalled_jobs(self, threshold).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        JobQueue::stats(self).await
    }
}

/// Snapshot of queue state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending_jobs: usize,
    pub processing_jobs: usize,
    pub dead_letter_jobs: usize,
    pub paused: bool,
}

impl QueueStats {
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.processing_jobs + self.dead_letter_jobs
    }
}
