//! Batch forecast generation.
//!
//! The orchestrator groups ready fixtures into batches, fans each batch
//! out to every eligible provider under a concurrency limit, retries
//! malformed-output failures, tracks spend and provider health, and
//! persists the sub-results that succeed.

pub mod run;

use std::collections::HashMap;

use serde::Serialize;

use crate::budget::BudgetStatus;

pub use run::GenerationOrchestrator;

/// Per-provider retry counters for one run.
///
/// `attempts` counts extra attempts beyond the initial call; `successes`
/// counts calls that ultimately succeeded after at least one retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProviderRetryStats {
    pub attempts: u32,
    pub successes: u32,
}

/// Aggregated retry counters across a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStatsSummary {
    pub total_retries: u32,
    pub successful_retries: u32,
    pub by_provider: HashMap<String, ProviderRetryStats>,
}

impl RetryStatsSummary {
    /// Folds one provider call outcome into the aggregate.
    pub fn record_call(&mut self, provider_id: &str, retries: u32, succeeded: bool) {
        if retries == 0 {
            return;
        }
        self.total_retries += retries;
        let entry = self.by_provider.entry(provider_id.to_string()).or_default();
        entry.attempts += retries;
        if succeeded {
            self.successful_retries += retries;
            entry.successes += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_provider.is_empty()
    }
}

/// Structured summary returned to the trigger caller.
///
/// Always produced, even when every provider failed; failures are
/// enumerated in `errors` rather than thrown.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Number of ready fixtures processed.
    pub matches: usize,
    /// Number of batches formed.
    pub batches: usize,
    /// Distinct providers dispatched at least once.
    pub providers: usize,
    /// Prediction records created.
    pub predictions: usize,
    /// Provider batch calls that ultimately succeeded.
    pub successful: usize,
    /// Provider dispatches skipped by the budget pre-check.
    pub skipped_due_to_budget: usize,
    /// Provider call outcomes that were rate-limit failures; feeds the
    /// queue circuit breaker at the worker layer.
    pub rate_limit_failures: usize,
    pub budget: BudgetStatus,
    #[serde(skip_serializing_if = "RetryStatsSummary::is_empty")]
    pub retry_stats: RetryStatsSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}
