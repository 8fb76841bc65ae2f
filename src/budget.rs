//! Daily spend tracking for provider calls.
//!
//! The tracker is the process-wide running ledger consulted before every
//! provider dispatch. Costs are held in cents (atomics) to avoid
//! floating-point drift; dollar values only appear at the API surface.
//! The counter resets at the UTC day boundary; durable history lives in
//! the `budget_ledger` table, which the orchestrator appends to once per
//! attempt and seeds the tracker from at startup.
//!
//! The cap only prevents *starting* new calls. A call already in flight
//! completes and its cost is recorded even if that lands over the cap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};

/// Cents per dollar for internal conversions.
const CENTS_PER_DOLLAR: f64 = 100.0;

/// Answer to "may this provider be called now".
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetDecision {
    pub skip: bool,
    pub reason: Option<String>,
}

impl BudgetDecision {
    fn allow() -> Self {
        Self {
            skip: false,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            skip: true,
            reason: Some(reason.into()),
        }
    }
}

/// Snapshot of budget state for run summaries and the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub daily_limit: f64,
    pub spent: f64,
    pub remaining: f64,
    pub percent_used: f64,
}

/// Process-wide spend ledger against a single daily cap.
pub struct BudgetTracker {
    daily_cap_cents: u64,
    spent_today_cents: AtomicU64,
    spent_by_provider: RwLock<HashMap<String, u64>>,
    tracking_day: RwLock<u32>,
}

impl BudgetTracker {
    /// Creates a tracker with the given daily cap in dollars.
    pub fn new(daily_cap: f64) -> Self {
        Self {
            daily_cap_cents: dollars_to_cents(daily_cap),
            spent_today_cents: AtomicU64::new(0),
            spent_by_provider: RwLock::new(HashMap::new()),
            tracking_day: RwLock::new(Utc::now().ordinal()),
        }
    }

    /// Seeds today's spend from persisted ledger entries, so a restarted
    /// process does not forget what it already spent today.
    pub fn seed(&self, spent_by_provider: HashMap<String, u64>) {
        let total: u64 = spent_by_provider.values().sum();
        self.spent_today_cents.store(total, Ordering::SeqCst);
        let mut by_provider = self
            .spent_by_provider
            .write()
            .expect("spent_by_provider lock poisoned");
        *by_provider = spent_by_provider;
    }

    /// Whether `provider_id` may start a call estimated to cost
    /// `estimated_cost_cents` right now. The estimate is per provider,
    /// so a cheap provider can still fit under the cap after an
    /// expensive one was turned away.
    ///
    /// Callers must invoke this sequentially across providers before any
    /// dispatch in a batch; the answer is stale the moment concurrent
    /// spending is allowed between check and call.
    pub fn may_call(&self, provider_id: &str, estimated_cost_cents: u64) -> BudgetDecision {
        self.maybe_reset_counter();
        let spent = self.spent_today_cents.load(Ordering::SeqCst);
        if spent >= self.daily_cap_cents {
            tracing::debug!(
                provider_id = provider_id,
                spent_cents = spent,
                cap_cents = self.daily_cap_cents,
                "Provider skipped: daily budget exhausted"
            );
            return BudgetDecision::deny(format!(
                "daily budget exhausted: spent ${:.2} of ${:.2}",
                cents_to_dollars(spent),
                cents_to_dollars(self.daily_cap_cents)
            ));
        }
        let projected = spent.saturating_add(estimated_cost_cents);
        if projected > self.daily_cap_cents {
            tracing::debug!(
                provider_id = provider_id,
                spent_cents = spent,
                estimated_cost_cents = estimated_cost_cents,
                cap_cents = self.daily_cap_cents,
                "Provider skipped: estimated call cost would exceed daily budget"
            );
            return BudgetDecision::deny(format!(
                "estimated call cost ${:.2} would exceed daily budget: spent ${:.2} of ${:.2}",
                cents_to_dollars(estimated_cost_cents),
                cents_to_dollars(spent),
                cents_to_dollars(self.daily_cap_cents)
            ));
        }
        BudgetDecision::allow()
    }

    /// Records the cost of one call attempt against a provider.
    ///
    /// Called exactly once per attempt, successful or not - failed calls
    /// are still billed by the vendor.
    pub fn record_cost(&self, provider_id: &str, cost_cents: u64) {
        self.maybe_reset_counter();
        self.spent_today_cents
            .fetch_add(cost_cents, Ordering::SeqCst);
        {
            let mut by_provider = self
                .spent_by_provider
                .write()
                .expect("spent_by_provider lock poisoned");
            *by_provider.entry(provider_id.to_string()).or_insert(0) += cost_cents;
        }
        tracing::debug!(
            provider_id = provider_id,
            cost_cents = cost_cents,
            "Recorded call cost"
        );
    }

    /// Current budget snapshot.
    pub fn status(&self) -> BudgetStatus {
        self.maybe_reset_counter();
        let spent = self.spent_today_cents.load(Ordering::SeqCst);
        let remaining = self.daily_cap_cents.saturating_sub(spent);
        BudgetStatus {
            daily_limit: cents_to_dollars(self.daily_cap_cents),
            spent: cents_to_dollars(spent),
            remaining: cents_to_dollars(remaining),
            percent_used: if self.daily_cap_cents == 0 {
                100.0
            } else {
                (spent as f64 / self.daily_cap_cents as f64) * 100.0
            },
        }
    }

    /// Today's spend per provider, in cents.
    pub fn spent_by_provider(&self) -> HashMap<String, u64> {
        self.maybe_reset_counter();
        self.spent_by_provider
            .read()
            .expect("spent_by_provider lock poisoned")
            .clone()
    }

    /// Resets the counters when the UTC day rolls over.
    fn maybe_reset_counter(&self) {
        let current_day = Utc::now().ordinal();
        let mut tracking_day = self
            .tracking_day
            .write()
            .expect("tracking_day lock poisoned");
        if *tracking_day != current_day {
            self.spent_today_cents.store(0, Ordering::SeqCst);
            self.spent_by_provider
                .write()
                .expect("spent_by_provider lock poisoned")
                .clear();
            *tracking_day = current_day;
            tracing::info!("Daily budget counter reset");
        }
    }
}

/// Estimated cost in cents for one batch call attempt.
///
/// Token volume is estimated per fixture and scaled by batch size; vendors
/// bill failed attempts too, so the estimate applies to every attempt.
pub fn estimate_attempt_cost_cents(
    batch_len: usize,
    est_input_tokens_per_fixture: u32,
    est_output_tokens_per_fixture: u32,
    cost_per_1m_input: f64,
    cost_per_1m_output: f64,
) -> u64 {
    let input_tokens = est_input_tokens_per_fixture as f64 * batch_len as f64;
    let output_tokens = est_output_tokens_per_fixture as f64 * batch_len as f64;
    let input_cents = (input_tokens / 1_000_000.0) * cost_per_1m_input * CENTS_PER_DOLLAR;
    let output_cents = (output_tokens / 1_000_000.0) * cost_per_1m_output * CENTS_PER_DOLLAR;
    (input_cents + output_cents).ceil() as u64
}

fn dollars_to_cents(dollars: f64) -> u64 {
    (dollars * CENTS_PER_DOLLAR).round() as u64
}

fn cents_to_dollars(cents: u64) -> f64 {
    cents as f64 / CENTS_PER_DOLLAR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tracker_allows_calls() {
        let tracker = BudgetTracker::new(10.0);
        let decision = tracker.may_call("p1", 5);
        assert!(!decision.skip);
        assert!(decision.reason.is_none());
    }

    #[test]
    fn test_exhausted_budget_denies_calls() {
        let tracker = BudgetTracker::new(1.0);
        tracker.record_cost("p1", 100);

        let decision = tracker.may_call("p1", 1);
        assert!(decision.skip);
        assert!(decision.reason.expect("reason set").contains("exhausted"));
        // The cap also blocks other providers: it is a shared daily cap.
        assert!(tracker.may_call("p2", 1).skip);
    }

    #[test]
    fn test_precheck_weighs_provider_cost() {
        // 99 of 100 cents spent: a 1-cent call still fits, a 6000-cent
        // call does not.
        let tracker = BudgetTracker::new(1.0);
        tracker.record_cost("cheap", 99);

        assert!(!tracker.may_call("cheap", 1).skip);
        let decision = tracker.may_call("expensive", 6000);
        assert!(decision.skip);
        assert!(decision
            .reason
            .expect("reason set")
            .contains("would exceed daily budget"));
    }

    #[test]
    fn test_cap_does_not_claw_back_overspend() {
        let tracker = BudgetTracker::new(1.0);
        // An in-flight call may complete over cap; its cost is still recorded.
        tracker.record_cost("p1", 250);
        let status = tracker.status();
        assert!((status.spent - 2.5).abs() < f64::EPSILON);
        assert_eq!(status.remaining, 0.0);
        assert!(status.percent_used > 100.0);
    }

    #[test]
    fn test_status_snapshot() {
        let tracker = BudgetTracker::new(10.0);
        tracker.record_cost("p1", 250);
        tracker.record_cost("p2", 250);

        let status = tracker.status();
        assert_eq!(status.daily_limit, 10.0);
        assert!((status.spent - 5.0).abs() < f64::EPSILON);
        assert!((status.remaining - 5.0).abs() < f64::EPSILON);
        assert!((status.percent_used - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_spend_by_provider_breakdown() {
        let tracker = BudgetTracker::new(10.0);
        tracker.record_cost("p1", 100);
        tracker.record_cost("p1", 50);
        tracker.record_cost("p2", 25);

        let by_provider = tracker.spent_by_provider();
        assert_eq!(by_provider["p1"], 150);
        assert_eq!(by_provider["p2"], 25);
    }

    #[test]
    fn test_seed_restores_spend() {
        let tracker = BudgetTracker::new(10.0);
        let mut seeded = HashMap::new();
        seeded.insert("p1".to_string(), 600);
        seeded.insert("p2".to_string(), 150);
        tracker.seed(seeded);

        let status = tracker.status();
        assert!((status.spent - 7.5).abs() < f64::EPSILON);
        assert!(!tracker.may_call("p1", 1).skip);

        tracker.record_cost("p1", 300);
        assert!(tracker.may_call("p1", 1).skip);
    }

    #[test]
    fn test_estimate_attempt_cost() {
        // 10 fixtures, 350 in / 120 out tokens each at $3 / $15 per 1M:
        // input: 3500/1M * 3 * 100 = 1.05 cents; output: 1200/1M * 15 * 100 = 1.8 cents
        // ceil(2.85) = 3 cents
        let cents = estimate_attempt_cost_cents(10, 350, 120, 3.0, 15.0);
        assert_eq!(cents, 3);
    }

    #[test]
    fn test_estimate_scales_with_batch_size() {
        // Rates high enough that ceil rounding is negligible:
        // batch 1 -> ceil(10.5 + 18) = 29, batch 100 -> 2850.
        let small = estimate_attempt_cost_cents(1, 350, 120, 300.0, 1500.0);
        let large = estimate_attempt_cost_cents(100, 350, 120, 300.0, 1500.0);
        assert_eq!(small, 29);
        assert_eq!(large, 2850);
        assert!(large > small * 50);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(dollars_to_cents(10.5), 1050);
        assert_eq!(dollars_to_cents(0.01), 1);
        assert_eq!(cents_to_dollars(1050), 10.5);
    }
}
