//! Distributed job scheduling.
//!
//! Generation runs are queued as Redis jobs and consumed by a worker
//! pool, with a circuit breaker that pauses consumption under sustained
//! provider rate limiting.

pub mod circuit;
pub mod job;
pub mod queue;
pub mod worker_pool;

pub use circuit::CircuitBreaker;
pub use job::{Job, JobKind, JobResult, JobStatus};
pub use queue::{JobQueue, QueueControl, QueueError, QueueInspect, QueueStats};
pub use worker_pool::{JobExecutors, PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
