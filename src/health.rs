//! Per-provider model health tracking.
//!
//! Counts consecutive call-outcome failures per provider and flips the
//! provider to auto-disabled once a threshold of consecutive failures is
//! reached. Any success clears the counter. The tracker never
//! re-activates a provider; that takes a manual or configuration-sync
//! reactivation.
//!
//! One "failure" here is one call *outcome*: a call that exhausted its
//! retries counts once, not once per attempt.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::providers::ProviderRecord;

/// Result of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// True only on the transition into the disabled state.
    pub auto_disabled: bool,
    /// The consecutive failure count after this failure.
    pub consecutive_failures: u32,
}

/// Mutable health state for one provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderHealth {
    pub consecutive_failures: u32,
    pub auto_disabled: bool,
}

/// Tracks consecutive failures per provider and auto-disables at a
/// threshold. Safe for concurrent use from provider dispatch tasks.
pub struct ModelHealthTracker {
    threshold: u32,
    state: RwLock<HashMap<String, ProviderHealth>>,
}

impl ModelHealthTracker {
    /// Creates a tracker that disables after `threshold` consecutive
    /// failures.
    pub fn new(threshold: u32) -> Self {
        assert!(threshold > 0, "auto-disable threshold must be non-zero");
        Self {
            threshold,
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Seeds in-memory state from persisted provider records so counts
    /// survive across runs.
    pub fn seed(&self, providers: &[ProviderRecord]) {
        let mut state = self.state.write().expect("health state lock poisoned");
        for provider in providers {
            state.insert(
                provider.id.clone(),
                ProviderHealth {
                    consecutive_failures: provider.consecutive_failures,
                    auto_disabled: provider.auto_disabled,
                },
            );
        }
    }

    /// Records a successful call outcome: the consecutive-failure count
    /// resets to zero immediately.
    pub fn record_success(&self, provider_id: &str) {
        let mut state = self.state.write().expect("health state lock poisoned");
        let entry = state.entry(provider_id.to_string()).or_default();
        if entry.consecutive_failures > 0 {
            tracing::debug!(
                provider_id = provider_id,
                previous_failures = entry.consecutive_failures,
                "Provider recovered, clearing failure count"
            );
        }
        entry.consecutive_failures = 0;
    }

    /// Records a failed call outcome.
    ///
    /// Returns whether this failure *transitioned* the provider into the
    /// disabled state; further failures on an already-disabled provider
    /// change nothing.
    pub fn record_failure(&self, provider_id: &str, reason: &str) -> FailureOutcome {
        let mut state = self.state.write().expect("health state lock poisoned");
        let entry = state.entry(provider_id.to_string()).or_default();

        if entry.auto_disabled {
            return FailureOutcome {
                auto_disabled: false,
                consecutive_failures: entry.consecutive_failures,
            };
        }

        entry.consecutive_failures += 1;
        let crossed = entry.consecutive_failures >= self.threshold;
        if crossed {
            entry.auto_disabled = true;
            tracing::warn!(
                provider_id = provider_id,
                consecutive_failures = entry.consecutive_failures,
                reason = reason,
                "Provider auto-disabled after consecutive failures"
            );
        } else {
            tracing::debug!(
                provider_id = provider_id,
                consecutive_failures = entry.consecutive_failures,
                reason = reason,
                "Provider failure recorded"
            );
        }

        FailureOutcome {
            auto_disabled: crossed,
            consecutive_failures: entry.consecutive_failures,
        }
    }

    /// Whether dispatch should skip this provider.
    pub fn is_disabled(&self, provider_id: &str) -> bool {
        self.state
            .read()
            .expect("health state lock poisoned")
            .get(provider_id)
            .map(|h| h.auto_disabled)
            .unwrap_or(false)
    }

    /// Snapshot of all tracked provider health, for flushing to storage
    /// after a run.
    pub fn snapshot(&self) -> HashMap<String, ProviderHealth> {
        self.state
            .read()
            .expect("health state lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_resets_counter() {
        let tracker = ModelHealthTracker::new(3);
        tracker.record_failure("p1", "parse error");
        tracker.record_failure("p1", "parse error");
        tracker.record_success("p1");

        let outcome = tracker.record_failure("p1", "parse error");
        assert_eq!(outcome.consecutive_failures, 1);
        assert!(!outcome.auto_disabled);
        assert!(!tracker.is_disabled("p1"));
    }

    #[test]
    fn test_auto_disable_at_threshold() {
        let tracker = ModelHealthTracker::new(3);
        assert!(!tracker.record_failure("p1", "e").auto_disabled);
        assert!(!tracker.record_failure("p1", "e").auto_disabled);

        let third = tracker.record_failure("p1", "e");
        assert!(third.auto_disabled);
        assert_eq!(third.consecutive_failures, 3);
        assert!(tracker.is_disabled("p1"));
    }

    #[test]
    fn test_fourth_failure_does_not_retransition() {
        let tracker = ModelHealthTracker::new(3);
        for _ in 0..3 {
            tracker.record_failure("p1", "e");
        }

        let fourth = tracker.record_failure("p1", "e");
        assert!(!fourth.auto_disabled);
        assert_eq!(fourth.consecutive_failures, 3);
        assert!(tracker.is_disabled("p1"));
    }

    #[test]
    fn test_failures_are_per_provider() {
        let tracker = ModelHealthTracker::new(2);
        tracker.record_failure("p1", "e");
        tracker.record_failure("p2", "e");

        assert!(!tracker.is_disabled("p1"));
        assert!(!tracker.is_disabled("p2"));

        tracker.record_failure("p1", "e");
        assert!(tracker.is_disabled("p1"));
        assert!(!tracker.is_disabled("p2"));
    }

    #[test]
    fn test_tracker_never_reactivates() {
        let tracker = ModelHealthTracker::new(1);
        tracker.record_failure("p1", "e");
        assert!(tracker.is_disabled("p1"));

        // A success cannot normally occur while disabled, but even if
        // recorded it must not clear the disabled flag.
        tracker.record_success("p1");
        assert!(tracker.is_disabled("p1"));
    }

    #[test]
    fn test_seed_from_records() {
        let tracker = ModelHealthTracker::new(3);
        let record = ProviderRecord {
            id: "p1".into(),
            display_name: "P1".into(),
            model: "m".into(),
            base_url: "u".into(),
            api_key_env: "K".into(),
            active: true,
            auto_disabled: true,
            consecutive_failures: 5,
            cost_per_1m_input: 1.0,
            cost_per_1m_output: 1.0,
        };
        tracker.seed(&[record]);

        assert!(tracker.is_disabled("p1"));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot["p1"].consecutive_failures, 5);
    }

    #[test]
    fn test_unknown_provider_is_not_disabled() {
        let tracker = ModelHealthTracker::new(3);
        assert!(!tracker.is_disabled("never-seen"));
    }
}
