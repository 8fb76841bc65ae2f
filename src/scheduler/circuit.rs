//! Queue circuit breaker for sustained provider rate limiting.
//!
//! When every generation job is failing on 429s, burning through the
//! queue just spends retry budget against a closed door. The breaker
//! counts consecutive rate-limited job outcomes and pauses the queue at
//! a threshold; a timed task resumes it unconditionally after the
//! cooldown, on the assumption that provider rate limits are
//! time-windowed. If the vendor is still limiting, the next jobs trip
//! the breaker again.
//!
//! State is in-memory only: a restart starts closed with a zero counter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::alerts::{Alert, AlertSink};

use super::queue::QueueControl;

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_rate_limits: u32,
    open: bool,
}

/// Pauses the job queue after a run of rate-limited job outcomes.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    queue: Arc<dyn QueueControl>,
    alerts: Arc<dyn AlertSink>,
    /// Shared with the timed-resume task spawned when the circuit opens.
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(
        threshold: u32,
        cooldown: Duration,
        queue: Arc<dyn QueueControl>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        assert!(threshold > 0, "circuit threshold must be non-zero");
        Self {
            threshold,
            cooldown,
            queue,
            alerts,
            state: Arc::new(Mutex::new(BreakerState::default())),
        }
    }

    /// Records a job outcome that was not a rate-limit failure. Any such
    /// outcome breaks the consecutive run.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_rate_limits = 0;
    }

    /// Records a rate-limited job outcome, pausing the queue if this
    /// reaches the threshold. The pause is issued exactly once per open.
    pub async fn record_rate_limit(&self) {
        let mut state = self.state.lock().await;
        if state.open {
            return;
        }

        state.consecutive_rate_limits += 1;
        tracing::debug!(
            consecutive = state.consecutive_rate_limits,
            threshold = self.threshold,
            "Rate-limited job outcome recorded"
        );
        if state.consecutive_rate_limits < self.threshold {
            return;
        }

        state.open = true;
        drop(state);
        self.open_circuit().await;
    }

    /// Whether the breaker is currently open (queue paused by us).
    pub async fn is_open(&self) -> bool {
        self.state.lock().await.open
    }

    async fn open_circuit(&self) {
        tracing::warn!(
            threshold = self.threshold,
            cooldown_secs = self.cooldown.as_secs(),
            "Circuit breaker tripped, pausing queue"
        );

        if let Err(e) = self.queue.pause().await {
            tracing::error!(error = %e, "Failed to pause queue");
        }

        self.alerts
            .send(
                Alert::warning(
                    "Generation queue paused",
                    "Sustained provider rate limiting; queue consumption paused",
                )
                .with_field("consecutive_rate_limits", self.threshold)
                .with_field("cooldown_secs", self.cooldown.as_secs()),
            )
            .await;

        // Timed unconditional resume.
        let queue = Arc::clone(&self.queue);
        let alerts = Arc::clone(&self.alerts);
        let state = Arc::clone(&self.state);
        let cooldown = self.cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            close_circuit(queue, alerts, state).await;
        });
    }
}

async fn close_circuit(
    queue: Arc<dyn QueueControl>,
    alerts: Arc<dyn AlertSink>,
    state: Arc<Mutex<BreakerState>>,
) {
    if let Err(e) = queue.resume().await {
        // Leave the operator a trail: the queue may still be paused.
        tracing::error!(error = %e, "Failed to resume queue after cooldown");
        alerts
            .send(Alert::error(
                "Queue resume failed",
                format!("Cooldown elapsed but the queue could not be resumed: {}", e),
            ))
            .await;
    } else {
        tracing::info!("Circuit breaker cooldown elapsed, queue resumed");
        alerts
            .send(Alert::info(
                "Generation queue resumed",
                "Circuit breaker cooldown elapsed; queue consumption resumed",
            ))
            .await;
    }

    let mut state = state.lock().await;
    state.open = false;
    state.consecutive_rate_limits = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::alerts::tests::CapturingSink;
    use crate::alerts::Severity;
    use crate::scheduler::queue::QueueError;

    #[derive(Default)]
    struct FakeQueue {
        pauses: AtomicUsize,
        resumes: AtomicUsize,
        paused: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl QueueControl for FakeQueue {
        async fn pause(&self) -> Result<(), QueueError> {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            self.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn resume(&self) -> Result<(), QueueError> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn is_paused(&self) -> Result<bool, QueueError> {
            Ok(self.paused.load(Ordering::SeqCst))
        }
    }

    fn breaker(
        threshold: u32,
        cooldown: Duration,
    ) -> (Arc<CircuitBreaker>, Arc<FakeQueue>, Arc<CapturingSink>) {
        let queue = Arc::new(FakeQueue::default());
        let alerts = Arc::new(CapturingSink::new());
        let breaker = Arc::new(CircuitBreaker::new(
            threshold,
            cooldown,
            Arc::clone(&queue) as Arc<dyn QueueControl>,
            Arc::clone(&alerts) as Arc<dyn AlertSink>,
        ));
        (breaker, queue, alerts)
    }

    #[tokio::test]
    async fn test_trips_at_threshold() {
        let (breaker, queue, alerts) = breaker(5, Duration::from_secs(60));

        for _ in 0..4 {
            breaker.record_rate_limit().await;
            assert!(!breaker.is_open().await);
        }
        breaker.record_rate_limit().await;

        assert!(breaker.is_open().await);
        assert_eq!(queue.pauses.load(Ordering::SeqCst), 1);
        let sent = alerts.alerts.lock().expect("alerts lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_success_resets_the_run() {
        let (breaker, queue, _alerts) = breaker(3, Duration::from_secs(60));

        breaker.record_rate_limit().await;
        breaker.record_rate_limit().await;
        breaker.record_success().await;
        breaker.record_rate_limit().await;
        breaker.record_rate_limit().await;

        assert!(!breaker.is_open().await);
        assert_eq!(queue.pauses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pauses_exactly_once_while_open() {
        let (breaker, queue, _alerts) = breaker(2, Duration::from_secs(60));

        for _ in 0..6 {
            breaker.record_rate_limit().await;
        }

        assert!(breaker.is_open().await);
        assert_eq!(queue.pauses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_resume_after_cooldown() {
        let (breaker, queue, alerts) = breaker(2, Duration::from_secs(60));

        breaker.record_rate_limit().await;
        breaker.record_rate_limit().await;
        assert!(breaker.is_open().await);

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert!(!breaker.is_open().await);
        assert_eq!(queue.resumes.load(Ordering::SeqCst), 1);
        assert!(!queue.is_paused().await.expect("queue state"));

        let sent = alerts.alerts.lock().expect("alerts lock");
        assert_eq!(sent.last().expect("resume alert").severity, Severity::Info);
    }

    #[tokio::test(start_paused = true)]
    async fn test_can_trip_again_after_resume() {
        let (breaker, queue, _alerts) = breaker(2, Duration::from_secs(30));

        breaker.record_rate_limit().await;
        breaker.record_rate_limit().await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(!breaker.is_open().await);

        breaker.record_rate_limit().await;
        breaker.record_rate_limit().await;

        assert!(breaker.is_open().await);
        assert_eq!(queue.pauses.load(Ordering::SeqCst), 2);
    }
}
