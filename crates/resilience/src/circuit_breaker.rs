//! Circuit breaker for a single external dependency.
//!
//! ```text
//! CLOSED    --failure_threshold consecutive failures-->  OPEN
//! OPEN      --timeout elapsed since last failure------->  HALF_OPEN (next call runs as a trial)
//! HALF_OPEN --success_threshold trial successes-------->  CLOSED
//! HALF_OPEN --any trial failure------------------------>  OPEN
//! ```
//!
//! The lock only guards bookkeeping; the wrapped function runs unlocked.

use std::fmt::Display;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use adpilot_core::{ensure_positive, ConfigResult};

use crate::stats::CallStats;

/// Breaker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    #[default]
    Closed,
    /// Dependency assumed down, calls fail fast
    Open,
    /// Probing whether the dependency recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Consecutive trial successes needed to close from half-open
    pub success_threshold: u32,
    /// Time spent open before a trial call is allowed
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            timeout,
            ..Default::default()
        }
    }

    pub fn with_success_threshold(mut self, success_threshold: u32) -> Self {
        self.success_threshold = success_threshold;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        ensure_positive("failure_threshold", self.failure_threshold.into())?;
        ensure_positive("success_threshold", self.success_threshold.into())?;
        Ok(())
    }
}

/// Returned instead of invoking the wrapped function while the breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker '{name}' is open; service appears unavailable, retry in {retry_in:?}")]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_in: Duration,
}

/// Error from [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// Rejected without calling the dependency.
    #[error(transparent)]
    Open(#[from] CircuitOpenError),
    /// The wrapped function ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CallError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Inner(e) => Some(e),
            CallError::Open(_) => None,
        }
    }
}

/// Point-in-time view of a breaker, for health endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub success_rate: f64,
    pub stats: CallStats,
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    stats: CallStats,
}

/// Failure tracker guarding one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `f` under the breaker.
    ///
    /// While open (and the timeout has not elapsed) `f` is not invoked and
    /// [`CallError::Open`] is returned immediately.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, CallError<E>>
    where
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        self.admit()?;

        match f() {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure(&err);
                Err(CallError::Inner(err))
            }
        }
    }

    /// Force the breaker back to CLOSED with cleared counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
        inner.last_failure_at = None;
        info!(breaker = %self.name, "circuit manually reset to closed");
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock();
        CircuitBreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            success_rate: inner.stats.success_rate(),
            stats: inner.stats.clone(),
        }
    }

    fn admit(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.timeout);
                if elapsed >= self.config.timeout {
                    info!(breaker = %self.name, "circuit transitioning to half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    return Ok(());
                }
                Err(CircuitOpenError {
                    name: self.name.clone(),
                    retry_in: self.config.timeout.saturating_sub(elapsed),
                })
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.stats.record_success();

        if inner.state == CircuitState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                info!(breaker = %self.name, "circuit closed after successful trial calls");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.success_count = 0;
            }
        } else if inner.state == CircuitState::Closed {
            inner.failure_count = 0;
        }
    }

    fn on_failure(&self, error: &dyn Display) {
        let mut inner = self.inner.lock();
        inner.stats.record_failure(error);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, error = %error, "trial call failed; circuit re-opened");
                inner.state = CircuitState::Open;
                inner.failure_count = self.config.failure_threshold;
                inner.success_count = 0;
            }
            _ => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold
                    && inner.state != CircuitState::Open
                {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_breaker(failure_threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new(failure_threshold, Duration::from_millis(timeout_ms))
                .with_success_threshold(2),
        )
    }

    fn fail(breaker: &CircuitBreaker) -> CallError<String> {
        breaker
            .call(|| Err::<(), _>("boom".to_string()))
            .unwrap_err()
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = fast_breaker(3, 10_000);

        for _ in 0..2 {
            assert!(!fail(&breaker).is_open());
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.status().failure_count, 3);
        assert!(breaker.status().last_failure_at.is_some());
    }

    #[test]
    fn open_circuit_fails_fast_without_calling() {
        let breaker = fast_breaker(1, 10_000);
        fail(&breaker);

        let invoked = Cell::new(false);
        let err = breaker
            .call(|| {
                invoked.set(true);
                Ok::<_, String>(())
            })
            .unwrap_err();

        assert!(err.is_open());
        assert!(!invoked.get());
        match err {
            CallError::Open(open) => {
                assert_eq!(open.name, "test");
                assert!(open.retry_in <= Duration::from_secs(10));
            }
            CallError::Inner(_) => panic!("expected open-circuit rejection"),
        }
    }

    #[test]
    fn success_resets_failure_count_while_closed() {
        let breaker = fast_breaker(3, 10_000);
        fail(&breaker);
        fail(&breaker);
        breaker.call(|| Ok::<_, String>(())).unwrap();
        assert_eq!(breaker.status().failure_count, 0);

        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn full_cycle_closed_open_half_open_closed() {
        let breaker = fast_breaker(3, 50);
        for _ in 0..3 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(fail(&breaker).is_open());

        std::thread::sleep(Duration::from_millis(70));

        // First trial moves to half-open; one success is not enough to close.
        breaker.call(|| Ok::<_, String>(())).unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.call(|| Ok::<_, String>(())).unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.status().failure_count, 0);
    }

    #[test]
    fn failed_trial_reopens_immediately() {
        let breaker = fast_breaker(3, 50);
        for _ in 0..3 {
            fail(&breaker);
        }
        std::thread::sleep(Duration::from_millis(70));

        let err = fail(&breaker);
        assert!(!err.is_open(), "the trial call must actually run");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.status().failure_count, 3);

        // Timeout restarts from the trial failure.
        assert!(fail(&breaker).is_open());
    }

    #[test]
    fn status_tracks_call_statistics() {
        let breaker = fast_breaker(5, 1_000);
        breaker.call(|| Ok::<_, String>(1)).unwrap();
        fail(&breaker);

        let status = breaker.status();
        assert_eq!(status.stats.total_calls, 2);
        assert_eq!(status.stats.successful_calls, 1);
        assert_eq!(status.stats.last_error.as_deref(), Some("boom"));
        assert_eq!(status.success_rate, 0.5);
        assert_eq!(status.state, CircuitState::Closed);
    }

    #[test]
    fn reset_closes_an_open_breaker() {
        let breaker = fast_breaker(1, 10_000);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        let status = breaker.status();
        assert_eq!(status.failure_count, 0);
        assert!(status.last_failure_at.is_none());
        assert!(breaker.call(|| Ok::<_, String>(())).is_ok());
    }

    #[test]
    fn late_success_keeps_an_open_breaker_failure_count() {
        let breaker = fast_breaker(1, 10_000);

        // The call is admitted while closed; another caller trips the breaker
        // before it returns.
        breaker
            .call(|| {
                fail(&breaker);
                Ok::<_, String>(())
            })
            .unwrap();

        let status = breaker.status();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failure_count, 1);
    }

    #[test]
    fn state_serializes_in_snake_case() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"half_open\"");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn config_rejects_zero_thresholds() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert!(CircuitBreakerConfig::new(0, Duration::from_secs(1)).validate().is_err());
    }
}
