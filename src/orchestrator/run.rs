//! Orchestrator run loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::budget::{estimate_attempt_cost_cents, BudgetTracker};
use crate::config::PipelineConfig;
use crate::error::{AdapterError, OrchestratorError};
use crate::fixtures::{build_batches, Fixture, FixtureBatch};
use crate::health::ModelHealthTracker;
use crate::providers::{ForecastProvider, HttpForecastProvider, ProviderRecord};
use crate::storage::{BudgetLedgerEntry, PredictionRecord, Store, StoreError};

use super::{RetryStatsSummary, RunSummary};

/// Upper bound on ready fixtures pulled into one run.
const READY_FIXTURE_LIMIT: i64 = 500;

/// What the retry loop should do after a failed attempt.
#[derive(Debug, PartialEq, Eq)]
enum AttemptStep {
    /// Sleep for the given delay, then retry.
    Retry(Duration),
    /// Surface the error as the call outcome.
    GiveUp,
}

/// Retry decision for one failed attempt. Only parse failures are
/// retried; the delay doubles per retry already used.
fn next_step(
    error: &AdapterError,
    retries_used: u32,
    max_retries: u32,
    base_delay: Duration,
) -> AttemptStep {
    if error.is_retryable() && retries_used < max_retries {
        AttemptStep::Retry(base_delay * 2u32.pow(retries_used))
    } else {
        AttemptStep::GiveUp
    }
}

/// Result of dispatching one batch to one provider, after retries.
struct DispatchOutcome {
    provider_id: String,
    succeeded: bool,
    predictions: usize,
    retries: u32,
    rate_limited: bool,
    errors: Vec<String>,
}

impl DispatchOutcome {
    fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            succeeded: false,
            predictions: 0,
            retries: 0,
            rate_limited: false,
            errors: Vec::new(),
        }
    }
}

/// Coordinates one generation run: batching, provider fan-out, retries,
/// budget and health accounting, and persistence.
///
/// Every collaborator is injected so the whole run loop can be driven
/// in-memory under test.
pub struct GenerationOrchestrator {
    config: PipelineConfig,
    store: Arc<dyn Store>,
    budget: Arc<BudgetTracker>,
    health: Arc<ModelHealthTracker>,
    /// Pre-registered adapters keyed by provider id. Providers without a
    /// registered adapter get an HTTP adapter built from their record.
    adapters: HashMap<String, Arc<dyn ForecastProvider>>,
    concurrency_limiter: Arc<Semaphore>,
}

impl GenerationOrchestrator {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn Store>,
        budget: Arc<BudgetTracker>,
        health: Arc<ModelHealthTracker>,
    ) -> Self {
        let concurrency_limiter = Arc::new(Semaphore::new(config.max_concurrent_providers));
        Self {
            config,
            store,
            budget,
            health,
            adapters: HashMap::new(),
            concurrency_limiter,
        }
    }

    /// Registers an adapter to use instead of the default HTTP adapter
    /// for its provider id.
    pub fn register_provider(&mut self, adapter: Arc<dyn ForecastProvider>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    /// Runs generation for all currently ready fixtures.
    pub async fn run(&self) -> Result<RunSummary, OrchestratorError> {
        let fixtures = self
            .store
            .load_ready_fixtures(READY_FIXTURE_LIMIT)
            .await
            .map_err(|e| OrchestratorError::LoadFixtures(e.to_string()))?;
        self.run_fixtures(fixtures).await
    }

    /// Runs generation for an explicit fixture list (queue jobs carry
    /// fixture ids; the trigger path loads ready fixtures itself).
    pub async fn run_fixture_ids(&self, ids: &[String]) -> Result<RunSummary, OrchestratorError> {
        let fixtures = self
            .store
            .load_fixtures(ids)
            .await
            .map_err(|e| OrchestratorError::LoadFixtures(e.to_string()))?;
        self.run_fixtures(fixtures).await
    }

    /// Runs the full pipeline over the given fixtures.
    ///
    /// Always returns a summary when the pipeline itself ran; provider
    /// failures are accumulated into `summary.errors` rather than
    /// propagated. Only failures that prevent the run from proceeding at
    /// all (fixture/provider loading, prompt rendering) become `Err`.
    pub async fn run_fixtures(
        &self,
        fixtures: Vec<Fixture>,
    ) -> Result<RunSummary, OrchestratorError> {
        let matches = fixtures.len();
        if matches == 0 {
            tracing::info!("No ready fixtures, nothing to do");
            return Ok(self.empty_summary());
        }

        let records = self
            .store
            .list_providers()
            .await
            .map_err(|e| OrchestratorError::LoadProviders(e.to_string()))?;
        self.health.seed(&records);

        let enabled: Vec<&ProviderRecord> = records.iter().filter(|r| r.is_enabled()).collect();
        let batches = build_batches(fixtures, self.config.batch_size)?;

        tracing::info!(
            matches = matches,
            batches = batches.len(),
            enabled_providers = enabled.len(),
            "Starting generation run"
        );

        let mut predictions = 0usize;
        let mut successful = 0usize;
        let mut skipped_due_to_budget = 0usize;
        let mut rate_limit_failures = 0usize;
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut retry_stats = RetryStatsSummary::default();
        let mut errors: Vec<String> = Vec::new();

        // Batches run sequentially so the budget pre-check always sees
        // the spend of everything dispatched before it.
        for batch in &batches {
            let mut eligible: Vec<(&ProviderRecord, Arc<dyn ForecastProvider>, Vec<String>, u64)> =
                Vec::new();

            for record in &enabled {
                // Re-check health every batch: a provider disabled in
                // batch N must not be dispatched in batch N+1.
                if self.health.is_disabled(&record.id) {
                    continue;
                }

                let pending = self.pending_fixture_ids(batch, &record.id).await?;
                if pending.is_empty() {
                    tracing::debug!(
                        provider_id = %record.id,
                        batch = batch.index,
                        "All fixtures in batch already predicted, skipping dispatch"
                    );
                    continue;
                }

                // The pre-check weighs this provider's own cost model, so
                // one expensive provider being over budget does not turn
                // away the cheap ones.
                let estimated_cents = estimate_attempt_cost_cents(
                    pending.len(),
                    self.config.est_input_tokens_per_fixture,
                    self.config.est_output_tokens_per_fixture,
                    record.cost_per_1m_input,
                    record.cost_per_1m_output,
                );
                let decision = self.budget.may_call(&record.id, estimated_cents);
                if decision.skip {
                    skipped_due_to_budget += 1;
                    tracing::warn!(
                        provider_id = %record.id,
                        batch = batch.index,
                        reason = decision.reason.as_deref().unwrap_or(""),
                        "Provider skipped for batch"
                    );
                    continue;
                }

                match self.adapter_for(record) {
                    Ok(adapter) => eligible.push((record, adapter, pending, estimated_cents)),
                    Err(e) => {
                        // A provider that cannot even be constructed is a
                        // failed call outcome: it counts toward auto-disable.
                        self.health.record_failure(&record.id, &e.to_string());
                        errors.push(format!("{}: {}", record.id, e));
                    }
                }
            }

            let futures: Vec<_> = eligible
                .into_iter()
                .map(|(record, adapter, pending, estimated_cents)| async move {
                    let _permit = self
                        .concurrency_limiter
                        .acquire()
                        .await
                        .expect("concurrency limiter closed");
                    self.dispatch(record, adapter, batch, pending, estimated_cents)
                        .await
                })
                .collect();

            for outcome in futures::future::join_all(futures).await {
                dispatched.insert(outcome.provider_id.clone());
                predictions += outcome.predictions;
                if outcome.succeeded {
                    successful += 1;
                }
                if outcome.rate_limited {
                    rate_limit_failures += 1;
                }
                retry_stats.record_call(&outcome.provider_id, outcome.retries, outcome.succeeded);
                errors.extend(outcome.errors);
            }
        }

        self.flush_health(&records, &mut errors).await;

        let summary = RunSummary {
            matches,
            batches: batches.len(),
            providers: dispatched.len(),
            predictions,
            successful,
            skipped_due_to_budget,
            rate_limit_failures,
            budget: self.budget.status(),
            retry_stats,
            errors,
        };

        tracing::info!(
            matches = summary.matches,
            batches = summary.batches,
            providers = summary.providers,
            predictions = summary.predictions,
            successful = summary.successful,
            skipped_due_to_budget = summary.skipped_due_to_budget,
            spent = summary.budget.spent,
            error_count = summary.errors.len(),
            "Generation run finished"
        );

        Ok(summary)
    }

    /// One provider call for one batch: retry loop, per-attempt cost
    /// accounting, health bookkeeping, and persistence of sub-results.
    async fn dispatch(
        &self,
        record: &ProviderRecord,
        adapter: Arc<dyn ForecastProvider>,
        batch: &FixtureBatch,
        pending: Vec<String>,
        estimated_cents: u64,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::new(&record.id);
        let mut retries = 0u32;
        let call_result = loop {
            let started = Instant::now();
            let result = adapter.forecast_batch(&batch.prompt, &pending).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            // Vendors bill failed attempts too: exactly one cost record
            // per attempt, before the attempt is considered closed.
            self.budget.record_cost(&record.id, estimated_cents);
            let entry = BudgetLedgerEntry::new(&record.id, estimated_cents, retries + 1);
            if let Err(e) = self.store.append_budget_entry(&entry).await {
                tracing::error!(
                    provider_id = %record.id,
                    error = %e,
                    "Failed to persist budget ledger entry"
                );
                outcome
                    .errors
                    .push(format!("{}: budget ledger write failed: {}", record.id, e));
            }

            match result {
                Ok(forecasts) => break Ok((forecasts, latency_ms)),
                Err(error) => match next_step(
                    &error,
                    retries,
                    self.config.max_retries,
                    self.config.retry_base_delay,
                ) {
                    AttemptStep::Retry(delay) => {
                        tracing::warn!(
                            provider_id = %record.id,
                            batch = batch.index,
                            attempt = retries + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Retrying provider call"
                        );
                        tokio::time::sleep(delay).await;
                        retries += 1;
                    }
                    AttemptStep::GiveUp => break Err(error),
                },
            }
        };
        outcome.retries = retries;

        match call_result {
            Ok((forecasts, latency_ms)) => {
                outcome.succeeded = true;
                // One health event per call outcome, not per attempt.
                self.health.record_success(&record.id);
                self.persist_forecasts(record, batch, &pending, forecasts, latency_ms, &mut outcome)
                    .await;
            }
            Err(error) => {
                outcome.rate_limited = error.is_rate_limit();
                let failure = self.health.record_failure(&record.id, &error.to_string());
                if failure.auto_disabled {
                    tracing::error!(
                        provider_id = %record.id,
                        consecutive_failures = failure.consecutive_failures,
                        "Provider auto-disabled for remainder of run"
                    );
                }
                outcome.errors.push(format!(
                    "{}: batch {} failed after {} attempt(s): {}",
                    record.id,
                    batch.index,
                    retries + 1,
                    error
                ));
            }
        }

        outcome
    }

    /// Stores one prediction per returned fixture; omitted fixtures and
    /// write failures become per-item errors without failing the call.
    async fn persist_forecasts(
        &self,
        record: &ProviderRecord,
        batch: &FixtureBatch,
        pending: &[String],
        forecasts: crate::providers::ProviderForecasts,
        latency_ms: u64,
        outcome: &mut DispatchOutcome,
    ) {
        for fixture_id in pending {
            let Some(forecast) = forecasts.forecasts.get(fixture_id) else {
                outcome.errors.push(format!(
                    "{}: no forecast returned for fixture '{}' in batch {}",
                    record.id, fixture_id, batch.index
                ));
                continue;
            };

            let prediction = PredictionRecord::new(
                fixture_id,
                &record.id,
                forecast.clone(),
                latency_ms,
                &forecasts.raw_response,
            );
            match self.store.insert_prediction(&prediction).await {
                Ok(()) => outcome.predictions += 1,
                Err(StoreError::DuplicatePrediction { .. }) => {
                    // Raced with a concurrent run; the existing record wins.
                    tracing::debug!(
                        provider_id = %record.id,
                        fixture_id = %fixture_id,
                        "Prediction already exists, skipping"
                    );
                }
                Err(e) => outcome.errors.push(format!(
                    "{}: failed to store prediction for '{}': {}",
                    record.id, fixture_id, e
                )),
            }
        }
    }

    /// The batch fixture ids this provider has not yet predicted.
    async fn pending_fixture_ids(
        &self,
        batch: &FixtureBatch,
        provider_id: &str,
    ) -> Result<Vec<String>, OrchestratorError> {
        let ids = batch.fixture_ids();
        let predicted = self.store.predicted_fixture_ids(&ids, provider_id).await?;
        Ok(ids.into_iter().filter(|id| !predicted.contains(id)).collect())
    }

    fn adapter_for(&self, record: &ProviderRecord) -> Result<Arc<dyn ForecastProvider>, AdapterError> {
        if let Some(adapter) = self.adapters.get(&record.id) {
            return Ok(Arc::clone(adapter));
        }
        let adapter = HttpForecastProvider::from_record(record, self.config.request_timeout)?;
        Ok(Arc::new(adapter))
    }

    /// Writes the end-of-run health snapshot back to storage so
    /// consecutive-failure counts survive across runs.
    async fn flush_health(&self, records: &[ProviderRecord], errors: &mut Vec<String>) {
        let snapshot = self.health.snapshot();
        for record in records {
            let Some(health) = snapshot.get(&record.id) else {
                continue;
            };
            if health.consecutive_failures == record.consecutive_failures
                && health.auto_disabled == record.auto_disabled
            {
                continue;
            }
            if let Err(e) = self
                .store
                .update_provider_health(
                    &record.id,
                    health.consecutive_failures,
                    health.auto_disabled,
                )
                .await
            {
                tracing::error!(
                    provider_id = %record.id,
                    error = %e,
                    "Failed to persist provider health"
                );
                errors.push(format!("{}: health write failed: {}", record.id, e));
            }
        }
    }

    fn empty_summary(&self) -> RunSummary {
        RunSummary {
            matches: 0,
            batches: 0,
            providers: 0,
            predictions: 0,
            successful: 0,
            skipped_due_to_budget: 0,
            rate_limit_failures: 0,
            budget: self.budget.status(),
            retry_stats: RetryStatsSummary::default(),
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_is_retried_with_backoff() {
        let base = Duration::from_secs(1);
        let err = AdapterError::Parse("bad json".into());

        assert_eq!(next_step(&err, 0, 2, base), AttemptStep::Retry(base));
        assert_eq!(
            next_step(&err, 1, 2, base),
            AttemptStep::Retry(Duration::from_secs(2))
        );
        assert_eq!(next_step(&err, 2, 2, base), AttemptStep::GiveUp);
    }

    #[test]
    fn test_rate_limit_is_never_retried() {
        let err = AdapterError::RateLimited("429".into());
        assert_eq!(
            next_step(&err, 0, 2, Duration::from_secs(1)),
            AttemptStep::GiveUp
        );
    }

    #[test]
    fn test_api_and_network_errors_are_not_retried() {
        let base = Duration::from_secs(1);
        let api = AdapterError::Api {
            code: 500,
            message: "oops".into(),
        };
        let net = AdapterError::Network("reset".into());
        assert_eq!(next_step(&api, 0, 2, base), AttemptStep::GiveUp);
        assert_eq!(next_step(&net, 0, 2, base), AttemptStep::GiveUp);
    }
}
