//! Background condition monitors.
//!
//! Two scheduled checks watch for silent failure modes the pipeline
//! cannot see from inside a run: a queue with no live consumers, and
//! fixtures that finished long ago without ever receiving a prediction.
//! Both report through the alert sink and return a structured snapshot
//! for the CLI and status endpoint.

pub mod completeness;
pub mod worker_health;

pub use completeness::{CompletenessMonitor, CompletenessReport};
pub use worker_health::{HealthSnapshot, WorkerHealthMonitor};
