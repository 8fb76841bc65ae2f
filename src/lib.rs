//! matchcast: LLM forecast generation pipeline for sports fixtures.
//!
//! Batches upcoming fixtures into shared prompts, fans the prompts out to
//! configured LLM providers, validates and persists the forecasts, and
//! wraps the whole pipeline in a protection layer: budget tracking,
//! provider health with auto-disable, a rate-limit circuit breaker on the
//! job queue, and worker/completeness monitors.

// Core modules
pub mod alerts;
pub mod budget;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod fixtures;
pub mod health;
pub mod monitor;
pub mod orchestrator;
pub mod providers;
pub mod scheduler;
pub mod server;
pub mod storage;

// Re-export commonly used error types
pub use error::{AdapterError, OrchestratorError};
