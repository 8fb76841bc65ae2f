//! Worker pool consuming pipeline jobs from the Redis queue.
//!
//! Each worker is an independent async task that polls the queue,
//! executes jobs with a timeout, and reports outcomes back: completions
//! and failures to the queue, rate-limit information to the circuit
//! breaker, and a periodic heartbeat read by the health monitor. A
//! paused queue is honored by not dequeueing at all.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::monitor::{CompletenessMonitor, WorkerHealthMonitor};
use crate::orchestrator::GenerationOrchestrator;

use super::circuit::CircuitBreaker;
use super::job::{Job, JobKind, JobResult};
use super::queue::{JobQueue, QueueControl, QueueError};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to reach the job queue.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Job execution failed inside the pipeline.
    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long each dequeue blocks before re-checking for shutdown.
    pub poll_interval: Duration,
    /// Maximum wall time for one job.
    pub job_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(1800),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    pub active_workers: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub average_job_duration: Duration,
}

impl PoolStats {
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let total = completed + failed;

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration: if total > 0 {
                Duration::from_millis(total_duration_ms / total)
            } else {
                Duration::ZERO
            },
        }
    }
}

/// The pipeline operations a worker can run, shared across workers.
pub struct JobExecutors {
    pub orchestrator: Arc<GenerationOrchestrator>,
    pub worker_health: Arc<WorkerHealthMonitor>,
    pub completeness: Arc<CompletenessMonitor>,
    pub circuit: Arc<CircuitBreaker>,
}

/// Pool of workers consuming the generation queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    executors: Arc<JobExecutors>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, queue: Arc<JobQueue>, executors: JobExecutors) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            queue,
            executors: Arc::new(executors),
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers, recovering any jobs a crashed worker left in
    /// the processing queue first.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        match self.queue.recover_processing_jobs().await {
            Ok(recovered) if recovered > 0 => {
                info!(recovered = recovered, "Recovered jobs from processing queue");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to recover processing jobs");
            }
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                executors: Arc::clone(&self.executors),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                job_timeout: self.config.job_timeout,
                stats: Arc::clone(&self.stats),
            };
            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");
        Ok(())
    }

    /// Signals all workers to stop and waits for in-flight jobs.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await {
            Ok(()) => {
                self.is_running.store(false, Ordering::SeqCst);
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                self.is_running.store(false, Ordering::SeqCst);
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }
}

/// A single worker task.
struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    executors: Arc<JobExecutors>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    job_timeout: Duration,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if let Err(e) = self.queue.heartbeat(&self.id).await {
                warn!(worker_id = %self.id, error = %e, "Failed to record heartbeat");
            }

            // Honor the circuit breaker's pause flag: do not pull jobs at
            // all while the queue is held closed.
            match self.queue.is_paused().await {
                Ok(true) => {
                    debug!(worker_id = %self.id, "Queue is paused, not dequeueing");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to check pause flag");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            }

            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        if let Err(e) = self.queue.clear_heartbeat(&self.id).await {
            warn!(worker_id = %self.id, error = %e, "Failed to clear heartbeat");
        }
        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process_job(&self, mut job: Job) {
        let job_id = job.id;
        let start_time = Instant::now();

        info!(
            worker_id = %self.id,
            job_id = %job_id,
            kind = job.kind.label(),
            attempt = job.attempts + 1,
            "Processing job"
        );

        self.stats.active_workers.fetch_add(1, Ordering::SeqCst);
        job.increment_attempts();

        let result = self.execute_with_timeout(&job).await;
        let duration = start_time.elapsed();
        self.stats.active_workers.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(job_result) => {
                if let Err(e) = self.queue.complete(job_id, job_result.clone()).await {
                    error!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        "Failed to mark job complete"
                    );
                }

                if job_result.is_success() {
                    self.stats.record_completion(duration);
                    info!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        duration_ms = duration.as_millis() as u64,
                        predictions = job_result.predictions.unwrap_or(0),
                        "Job completed"
                    );
                } else {
                    self.stats.record_failure(duration);
                    warn!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        status = %job_result.status,
                        error = ?job_result.error,
                        "Job finished with failure status"
                    );
                }
            }
            Err(e) => {
                self.stats.record_failure(duration);

                if job.should_retry() {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        remaining_attempts = job.remaining_attempts(),
                        "Job failed, requeueing for retry"
                    );
                    if let Err(requeue_err) = self.queue.requeue(job).await {
                        error!(
                            worker_id = %self.id,
                            job_id = %job_id,
                            error = %requeue_err,
                            "Failed to requeue job"
                        );
                    }
                } else {
                    error!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        "Job failed, moving to dead letter queue"
                    );
                    if let Err(dlq_err) = self.queue.dead_letter(job, &e.to_string()).await {
                        error!(
                            worker_id = %self.id,
                            job_id = %job_id,
                            error = %dlq_err,
                            "Failed to move job to dead letter queue"
                        );
                    }
                }
            }
        }
    }

    async fn execute_with_timeout(&self, job: &Job) -> Result<JobResult, PoolError> {
        let start_time = Instant::now();

        match &job.kind {
            JobKind::Generate { fixture_ids } => {
                let run = async {
                    if fixture_ids.is_empty() {
                        self.executors.orchestrator.run().await
                    } else {
                        self.executors.orchestrator.run_fixture_ids(fixture_ids).await
                    }
                };

                match tokio::time::timeout(self.job_timeout, run).await {
                    Ok(Ok(summary)) => {
                        // Feed the circuit breaker with the job outcome.
                        if summary.rate_limit_failures > 0 {
                            self.executors.circuit.record_rate_limit().await;
                        } else {
                            self.executors.circuit.record_success().await;
                        }

                        let duration_ms = start_time.elapsed().as_millis() as u64;
                        Ok(JobResult::success(job.id, &self.id, duration_ms)
                            .with_predictions(summary.predictions))
                    }
                    Ok(Err(e)) => {
                        self.executors.circuit.record_success().await;
                        Err(PoolError::Pipeline(e.to_string()))
                    }
                    Err(_) => {
                        self.executors.circuit.record_success().await;
                        let duration_ms = start_time.elapsed().as_millis() as u64;
                        Ok(JobResult::timeout(job.id, &self.id, duration_ms))
                    }
                }
            }
            JobKind::WorkerHealthCheck => {
                let duration_ms = || start_time.elapsed().as_millis() as u64;
                match self.executors.worker_health.check().await {
                    // Unhealthy still completes the job: the alert went out.
                    Ok(_snapshot) => Ok(JobResult::success(job.id, &self.id, duration_ms())),
                    Err(e) => Err(PoolError::Pipeline(e.to_string())),
                }
            }
            JobKind::CompletenessCheck => {
                let duration_ms = || start_time.elapsed().as_millis() as u64;
                match self.executors.completeness.check().await {
                    Ok(_report) => Ok(JobResult::success(job.id, &self.id, duration_ms())),
                    Err(e) => Err(PoolError::Pipeline(e.to_string())),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.job_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 2,
            active_workers: 1,
            jobs_completed: 8,
            jobs_failed: 2,
            average_job_duration: Duration::from_secs(30),
        };
        assert_eq!(stats.total_processed(), 10);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_stats_average_duration() {
        let stats = SharedPoolStats::new();
        stats.record_completion(Duration::from_secs(10));
        stats.record_completion(Duration::from_secs(20));
        stats.record_failure(Duration::from_secs(5));

        let pool_stats = stats.to_pool_stats(2);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_failed, 1);
        assert!(pool_stats.average_job_duration.as_millis() > 11_000);
        assert!(pool_stats.average_job_duration.as_millis() < 12_000);
    }

    #[test]
    fn test_empty_stats_success_rate_is_zero() {
        let stats = PoolStats::default();
        assert!((stats.success_rate() - 0.0).abs() < f64::EPSILON);
    }
}
