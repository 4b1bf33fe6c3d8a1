//! Stops hammering a storage backend that keeps failing fetches.
//!
//! After a run of consecutive failures fetching is disabled for a
//! cooldown period, during which fetches return nothing without
//! touching storage. The first fetch after the cooldown is let
//! through with a fresh count.

use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    disabled_since: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct FetchBreaker {
    threshold: u32,
    disabled_duration: Duration,
    state: Mutex<BreakerState>,
}

impl FetchBreaker {
    pub(crate) fn new(threshold: u32, disabled_duration: Duration) -> Self {
        Self {
            threshold,
            disabled_duration,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Whether a fetch may go to storage right now.
    pub(crate) fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.consecutive_failures < self.threshold {
            return true;
        }
        match state.disabled_since {
            Some(since) if now.saturating_duration_since(since) < self.disabled_duration => false,
            _ => {
                tracing::info!("Re-enabling checkpoint fetching after cooldown");
                state.consecutive_failures = 0;
                state.disabled_since = None;
                true
            }
        }
    }

    pub(crate) fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.disabled_since = None;
    }

    /// Count a failed fetch. Returns `true` if this failure disabled
    /// fetching.
    pub(crate) fn record_failure(&self) -> bool {
        self.record_failure_at(Instant::now())
    }

    fn record_failure_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures == self.threshold {
            state.disabled_since = Some(now);
            tracing::error!(
                "Checkpoint fetching failed {} times in a row; disabling it for {:?}",
                self.threshold,
                self.disabled_duration
            );
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }
}

#[test]
fn breaker_opens_at_threshold() {
    let breaker = FetchBreaker::new(3, Duration::from_secs(60));
    assert!(!breaker.record_failure());
    assert!(!breaker.record_failure());
    assert!(breaker.allow());
    assert!(breaker.record_failure());
    assert!(!breaker.allow());
    assert_eq!(breaker.consecutive_failures(), 3);
}

#[test]
fn success_resets_count() {
    let breaker = FetchBreaker::new(3, Duration::from_secs(60));
    breaker.record_failure();
    breaker.record_failure();
    breaker.record_success();
    assert_eq!(breaker.consecutive_failures(), 0);
    breaker.record_failure();
    breaker.record_failure();
    assert!(breaker.allow());
}

#[test]
fn breaker_probes_after_cooldown() {
    let breaker = FetchBreaker::new(2, Duration::from_millis(100));
    let start = Instant::now();
    breaker.record_failure_at(start);
    breaker.record_failure_at(start);

    assert!(!breaker.allow_at(start + Duration::from_millis(50)));
    assert!(breaker.allow_at(start + Duration::from_millis(100)));
    assert_eq!(breaker.consecutive_failures(), 0);

    // A failed probe starts counting again from one.
    assert!(!breaker.record_failure_at(start + Duration::from_millis(110)));
    assert!(breaker.allow_at(start + Duration::from_millis(120)));
}
