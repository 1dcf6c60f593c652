//! Circuit breaker for datastore dependencies.
//!
//! Five consecutive failures open the circuit for 30 seconds; while open,
//! acquires fail fast. After the recovery window a single trial request is
//! let through (half-open); one success closes the circuit, one failure
//! re-opens it.
//!
//! Shared by the connection pools and the L2 cache client.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Consecutive failures needed to open the circuit.
pub const FAILURE_THRESHOLD: u32 = 5;

/// How long an open circuit rejects requests before allowing a trial.
pub const OPEN_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    open_for: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self::with_config(name, FAILURE_THRESHOLD, OPEN_DURATION)
    }

    pub fn with_config(name: &'static str, failure_threshold: u32, open_for: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            open_for,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Whether a request may proceed right now. Open circuits reject; an
    /// elapsed recovery window admits exactly one trial request.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return true;
        };

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_for {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(
                        target: "authz.circuit",
                        circuit = self.name,
                        "Circuit half-open, admitting trial request"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.state != CircuitState::Closed {
            info!(
                target: "authz.circuit",
                circuit = self.name,
                "Circuit closed after successful request"
            );
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.consecutive_failures += 1;
        inner.trial_in_flight = false;

        let should_open = match inner.state {
            // A failed trial re-opens immediately
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                target: "authz.circuit",
                circuit = self.name,
                consecutive_failures = inner.consecutive_failures,
                open_for_secs = self.open_for.as_secs(),
                "Circuit opened"
            );
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::with_config("test", 5, Duration::from_millis(20))
    }

    #[test]
    fn test_closed_until_threshold() {
        let cb = fast_breaker();
        for _ in 0..4 {
            assert!(cb.try_acquire());
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = fast_breaker();
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_single_trial_then_close() {
        let cb = fast_breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert!(!cb.try_acquire());

        std::thread::sleep(Duration::from_millis(25));

        // First caller after the window gets the trial slot
        assert!(cb.try_acquire());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Others are rejected while the trial is in flight
        assert!(!cb.try_acquire());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let cb = fast_breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.try_acquire());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire());
    }
}
