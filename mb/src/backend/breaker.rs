//! Per-adapter circuit breaker
//!
//! Independent from the rate-limiter breaker in `guard::rate_limit`. Trips
//! after N consecutive classified failures, fails fast while open, and admits
//! exactly one half-open probe after the reset timeout.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::GatewayError;

/// Breaker state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Rejecting immediately
    Open,
    /// One probe request in flight after the reset timeout
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Point-in-time view for health reporting
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    /// Time since the breaker last opened, if it is not closed
    pub open_for: Option<Duration>,
}

/// Consecutive-failure circuit breaker
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker for the named backend
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Admission check before an upstream attempt
    ///
    /// Closed admits. Open admits a single probe once the reset timeout has
    /// elapsed (transitioning to half-open); otherwise it fails fast without
    /// contacting the upstream. Half-open rejects while the probe is out.
    pub fn check(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Err(self.unavailable()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_timeout {
                    debug!(backend = %self.name, "Breaker half-open, admitting probe");
                    inner.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(self.unavailable())
                }
            }
        }
    }

    /// Whether an attempt would currently be admitted (non-mutating)
    pub fn would_allow(&self) -> bool {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => inner
                .opened_at
                .map(|t| t.elapsed() >= self.reset_timeout)
                .unwrap_or(true),
        }
    }

    /// Record a successful upstream round-trip
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != BreakerState::Closed {
            debug!(backend = %self.name, "Breaker closing after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record a classified failure
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;

        let tripped = inner.state == BreakerState::HalfOpen || inner.consecutive_failures >= self.failure_threshold;
        if tripped {
            if inner.state != BreakerState::Open {
                warn!(
                    backend = %self.name,
                    failures = inner.consecutive_failures,
                    "Circuit breaker opened"
                );
            }
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Operator hook: open immediately
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        warn!(backend = %self.name, "Circuit breaker force-opened");
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
    }

    /// Operator hook: close and reset the failure counter
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Current state
    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Point-in-time snapshot for health reporting
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_for: inner.opened_at.map(|t| t.elapsed()),
        }
    }

    fn unavailable(&self) -> GatewayError {
        GatewayError::BackendUnavailable {
            backend: self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new("test", threshold, reset)
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker(5, Duration::from_secs(30));

        for _ in 0..4 {
            b.record_failure();
            assert_eq!(b.state(), BreakerState::Closed);
        }

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(matches!(b.check(), Err(GatewayError::BackendUnavailable { .. })));
    }

    #[test]
    fn test_success_resets_counter() {
        let b = breaker(3, Duration::from_secs(30));

        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_reset_timeout() {
        let b = breaker(1, Duration::from_millis(0));

        b.record_failure();
        // Reset timeout of zero: next check admits the probe
        assert!(b.check().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        // Second caller is rejected while the probe is out
        assert!(b.check().is_err());

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = breaker(1, Duration::from_millis(0));

        b.record_failure();
        assert!(b.check().is_ok());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.snapshot().open_for.is_some());
    }

    #[test]
    fn test_open_rejects_before_reset() {
        let b = breaker(1, Duration::from_secs(60));

        b.record_failure();
        assert!(b.check().is_err());
        assert!(!b.would_allow());
    }

    #[test]
    fn test_force_hooks() {
        let b = breaker(5, Duration::from_secs(30));

        b.force_open();
        assert_eq!(b.state(), BreakerState::Open);

        b.force_close();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.check().is_ok());
    }

    #[test]
    fn test_check_is_fast_while_open() {
        let b = breaker(1, Duration::from_secs(60));
        b.record_failure();

        let start = Instant::now();
        for _ in 0..1000 {
            let _ = b.check();
        }
        // Rejection is a lock and a comparison, far under the 100ms bound
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
