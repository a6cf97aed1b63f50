//! Circuit breaker gating batch dispatch
//!
//! Tracks consecutive failures and stops further work after a threshold is
//! reached, until a cooldown elapses. State transitions:
//!
//! ```text
//! Closed   -> Open:     failure_count reaches threshold
//! Open     -> HalfOpen: cooldown elapsed since last failure, one trial admitted
//! HalfOpen -> Closed:   trial succeeded, failure count reset
//! HalfOpen -> Open:     trial failed, failure time re-stamped
//! ```
//!
//! The breaker is the one structure read and written from both the scheduling
//! path and the failure-reporting path, so its state sits behind a mutex.

use crate::defaults;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// Set while the single half-open trial call is outstanding
    trial_in_flight: bool,
}

/// Fail-fast gate over consecutive remote failures
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Whether the caller may submit new work.
    ///
    /// In Open state this also performs the Open -> HalfOpen transition once
    /// the cooldown has elapsed, admitting exactly one trial call.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.cooldown {
                    info!("Circuit breaker half-open, admitting trial call");
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            // One trial at a time
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call: resets the failure streak and closes the
    /// breaker if a trial was in flight.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == BreakerState::HalfOpen {
            info!("Circuit breaker trial succeeded, closing");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.trial_in_flight = false;
    }

    /// Record a failed call: bumps the streak, opens the breaker at the
    /// threshold, and re-opens immediately on a failed trial.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;

        match inner.state {
            BreakerState::Closed => {
                if inner.failure_count >= self.failure_threshold {
                    warn!(
                        "Circuit breaker opened after {} consecutive failures",
                        inner.failure_count
                    );
                    inner.state = BreakerState::Open;
                }
            }
            BreakerState::HalfOpen => {
                warn!("Circuit breaker trial failed, re-opening");
                inner.state = BreakerState::Open;
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner
            .lock()
            .expect("breaker lock poisoned")
            .failure_count
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(
            defaults::FAILURE_THRESHOLD,
            Duration::from_secs(defaults::BREAKER_COOLDOWN_SECS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_starts_closed_and_allows() {
        let breaker = CircuitBreaker::default();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_success_resets_streak_while_closed() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);

        // Streak restarts from zero
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_single_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));

        breaker.record_failure();
        assert!(!breaker.allow());

        sleep(Duration::from_millis(30));

        // First caller gets the trial, second is rejected
        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_trial_success_closes() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        sleep(Duration::from_millis(20));

        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.allow());
    }

    #[test]
    fn test_trial_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(50));
        breaker.record_failure();
        sleep(Duration::from_millis(60));

        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        // Failure time was re-stamped, cooldown restarts
        assert!(!breaker.allow());
    }
}
