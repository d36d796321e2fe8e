//! Retry with exponential backoff and jitter.

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use adpilot_core::{ensure_positive, ConfigError, ConfigResult};

use crate::circuit_breaker::{CallError, CircuitBreaker, CircuitOpenError};
use crate::stats::CallStats;

/// Fraction of the backoff delay used as the jitter range (±25%).
const JITTER_FRACTION: f64 = 0.25;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap (applied before jitter)
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub exponential_base: f64,
    /// Perturb each delay by up to ±25%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a config with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.exponential_base >= 1.0) {
            return Err(ConfigError::inconsistent(
                "exponential_base",
                format!("must be >= 1.0, got {}", self.exponential_base),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::inconsistent("base_delay", "exceeds max_delay"));
        }
        ensure_positive("max_attempts", u64::from(self.max_retries) + 1)
    }

    /// Backoff before the retry that follows failed attempt `attempt` (0-indexed),
    /// without jitter: `min(base_delay * exponential_base^attempt, max_delay)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let exp = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let delay = (base * exp).min(max);
        Duration::try_from_secs_f64(delay).unwrap_or(self.max_delay)
    }

    /// [`backoff_delay`](Self::backoff_delay) with jitter applied when enabled.
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.backoff_delay(attempt).as_secs_f64();
        if !self.jitter || delay == 0.0 {
            return Duration::from_secs_f64(delay);
        }
        let range = delay * JITTER_FRACTION;
        let jittered = delay + rng.gen_range(-range..=range);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// Classification used by [`RetryHandler::execute`].
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

/// Marker error: an `anyhow::Error` whose chain contains a `Terminal` is never
/// retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Terminal(pub String);

/// Build a non-retryable `anyhow::Error`.
pub fn terminal(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(Terminal(message.into()))
}

impl Classify for anyhow::Error {
    fn classify(&self) -> ErrorClass {
        if self.chain().any(|cause| cause.is::<Terminal>()) {
            ErrorClass::Terminal
        } else {
            ErrorClass::Retryable
        }
    }
}

impl Classify for std::io::Error {
    fn classify(&self) -> ErrorClass {
        use std::io::ErrorKind::*;
        match self.kind() {
            TimedOut | Interrupted | ConnectionReset | ConnectionAborted | ConnectionRefused
            | WouldBlock => ErrorClass::Retryable,
            _ => ErrorClass::Terminal,
        }
    }
}

/// Error from [`RetryHandler::execute`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The bound breaker rejected the attempt; never retried.
    #[error(transparent)]
    CircuitOpen(CircuitOpenError),
    /// A non-retryable failure; remaining attempts were not used.
    #[error("non-retryable failure: {0}")]
    Terminal(E),
    /// Every attempt failed; wraps the last failure.
    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RetryError::CircuitOpen(_))
    }

    /// The underlying failure, if the function was actually invoked.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::CircuitOpen(_) => None,
            RetryError::Terminal(e) | RetryError::Exhausted { last: e, .. } => Some(e),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::CircuitOpen(_) => None,
            RetryError::Terminal(e) | RetryError::Exhausted { last: e, .. } => Some(e),
        }
    }
}

type SleepFn = Arc<dyn Fn(Duration) + Send + Sync>;

/// Executes a unit of work with bounded retries.
pub struct RetryHandler {
    config: RetryConfig,
    breaker: Option<Arc<CircuitBreaker>>,
    stats: Mutex<CallStats>,
    sleep: SleepFn,
}

impl fmt::Debug for RetryHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHandler")
            .field("config", &self.config)
            .field("breaker", &self.breaker.as_ref().map(|b| b.name().to_string()))
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            breaker: None,
            stats: Mutex::new(CallStats::default()),
            sleep: Arc::new(std::thread::sleep),
        }
    }

    /// Route every attempt through `breaker`.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Replace the between-attempt sleep (tests observe delays this way).
    pub fn with_sleep<F>(mut self, sleep: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.sleep = Arc::new(sleep);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn stats(&self) -> CallStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = CallStats::default();
    }

    /// Run `f`, retrying failures its error type classifies as retryable.
    pub fn execute<T, E, F>(&self, f: F) -> Result<T, RetryError<E>>
    where
        E: Classify + Display,
        F: FnMut() -> Result<T, E>,
    {
        self.execute_with(f, E::classify)
    }

    /// Run `f`, retrying failures for which `classify` returns
    /// [`ErrorClass::Retryable`].
    pub fn execute_with<T, E, F, C>(&self, mut f: F, classify: C) -> Result<T, RetryError<E>>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
        C: Fn(&E) -> ErrorClass,
    {
        let total_attempts = self.config.max_retries + 1;
        let mut attempt = 0;

        loop {
            let outcome = match &self.breaker {
                Some(breaker) => match breaker.call(&mut f) {
                    Ok(value) => Ok(value),
                    Err(CallError::Inner(err)) => Err(err),
                    Err(CallError::Open(open)) => {
                        warn!(breaker = %open.name, "circuit open; not retrying");
                        self.stats.lock().record_failure(&open);
                        return Err(RetryError::CircuitOpen(open));
                    }
                },
                None => f(),
            };

            let err = match outcome {
                Ok(value) => {
                    self.stats.lock().record_success();
                    return Ok(value);
                }
                Err(err) => err,
            };

            if classify(&err) == ErrorClass::Terminal {
                error!(error = %err, "non-retryable error");
                self.stats.lock().record_failure(&err);
                return Err(RetryError::Terminal(err));
            }

            if attempt >= self.config.max_retries {
                error!(attempts = total_attempts, error = %err, "all attempts failed");
                self.stats.lock().record_failure(&err);
                return Err(RetryError::Exhausted {
                    attempts: total_attempts,
                    last: err,
                });
            }

            let delay = self.config.delay_for_attempt(attempt, &mut rand::thread_rng());
            warn!(
                attempt = attempt + 1,
                total_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed; retrying"
            );
            self.stats.lock().record_retry();
            (self.sleep)(delay);
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use proptest::prelude::*;
    use std::cell::Cell;

    fn recording_handler(config: RetryConfig) -> (RetryHandler, Arc<Mutex<Vec<Duration>>>) {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let sink = delays.clone();
        let handler = RetryHandler::new(config).with_sleep(move |d| sink.lock().push(d));
        (handler, delays)
    }

    fn spec_config() -> RetryConfig {
        RetryConfig::exponential(2, Duration::from_secs(1), Duration::from_secs(10))
            .with_exponential_base(2.0)
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let config = RetryConfig::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        let config = RetryConfig::exponential(10, Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(config.backoff_delay(4), Duration::from_secs(10));
        assert_eq!(config.backoff_delay(60), Duration::from_secs(10));
    }

    #[test]
    fn always_failing_function_is_called_max_retries_plus_one_times() {
        let (handler, delays) = recording_handler(spec_config().with_jitter(false));
        let calls = Cell::new(0);

        let err = handler
            .execute(|| {
                calls.set(calls.get() + 1);
                Err::<(), _>(anyhow::anyhow!("upstream 503"))
            })
            .unwrap_err();

        assert_eq!(calls.get(), 3);
        match &err {
            RetryError::Exhausted { attempts, last } => {
                assert_eq!(*attempts, 3);
                assert_eq!(last.to_string(), "upstream 503");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(
            *delays.lock(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );

        let stats = handler.stats();
        assert_eq!(stats.total_retries, 2);
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.last_error.as_deref(), Some("upstream 503"));
    }

    #[test]
    fn jittered_delays_stay_within_a_quarter_of_backoff() {
        let (handler, delays) = recording_handler(spec_config());
        let _ = handler.execute(|| Err::<(), _>(anyhow::anyhow!("flaky")));

        let delays = delays.lock();
        assert_eq!(delays.len(), 2);
        for (attempt, delay) in delays.iter().enumerate() {
            let backoff = spec_config().backoff_delay(attempt as u32).as_secs_f64();
            assert!(backoff <= 10.0);
            assert!(delay.as_secs_f64() <= backoff * 1.25 + 1e-9);
            assert!(delay.as_secs_f64() >= backoff * 0.75 - 1e-9);
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let (handler, _) = recording_handler(spec_config());
        let calls = Cell::new(0);

        let value = handler
            .execute(|| {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(anyhow::anyhow!("timeout"))
                } else {
                    Ok(42)
                }
            })
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(handler.stats().successful_calls, 1);
        assert_eq!(handler.stats().total_retries, 2);
    }

    #[test]
    fn terminal_error_is_not_retried() {
        let (handler, delays) = recording_handler(spec_config());
        let calls = Cell::new(0);

        let err = handler
            .execute(|| {
                calls.set(calls.get() + 1);
                Err::<(), _>(terminal("invalid credentials"))
            })
            .unwrap_err();

        assert_eq!(calls.get(), 1);
        assert!(matches!(err, RetryError::Terminal(_)));
        assert!(delays.lock().is_empty());
    }

    #[test]
    fn terminal_marker_survives_added_context() {
        let err = terminal("bad request").context("creating ad group");
        assert_eq!(err.classify(), ErrorClass::Terminal);
        assert_eq!(anyhow::anyhow!("reset").classify(), ErrorClass::Retryable);
    }

    #[test]
    fn io_errors_classify_by_kind() {
        use std::io::{Error, ErrorKind};
        assert_eq!(Error::from(ErrorKind::TimedOut).classify(), ErrorClass::Retryable);
        assert_eq!(Error::from(ErrorKind::PermissionDenied).classify(), ErrorClass::Terminal);
    }

    #[test]
    fn explicit_classifier_overrides_default() {
        let (handler, _) = recording_handler(spec_config());
        let calls = Cell::new(0);

        let err = handler
            .execute_with(
                || {
                    calls.set(calls.get() + 1);
                    Err::<(), _>(404u16)
                },
                |status| {
                    if *status >= 500 {
                        ErrorClass::Retryable
                    } else {
                        ErrorClass::Terminal
                    }
                },
            )
            .unwrap_err();

        assert_eq!(calls.get(), 1);
        assert_eq!(err.into_last_error(), Some(404));
    }

    #[test]
    fn open_circuit_propagates_without_retrying() {
        let breaker = Arc::new(CircuitBreaker::new(
            "ads",
            CircuitBreakerConfig::new(1, Duration::from_secs(60)),
        ));
        let (handler, delays) = recording_handler(spec_config());
        let handler = handler.with_breaker(breaker.clone());
        let calls = Cell::new(0);

        let err = handler
            .execute(|| {
                calls.set(calls.get() + 1);
                Err::<(), _>(anyhow::anyhow!("503"))
            })
            .unwrap_err();

        // First attempt trips the breaker; the retry is rejected fast.
        assert_eq!(calls.get(), 1);
        assert!(err.is_circuit_open());
        assert_eq!(delays.lock().len(), 1);
        assert_eq!(breaker.state(), crate::CircuitState::Open);
    }

    #[test]
    fn zero_retries_means_single_attempt() {
        let (handler, delays) = recording_handler(RetryConfig::no_retry());
        let err = handler.execute(|| Err::<(), _>(anyhow::anyhow!("x"))).unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 1, .. }));
        assert!(delays.lock().is_empty());
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        assert!(RetryConfig::default().validate().is_ok());
        let config = RetryConfig::exponential(1, Duration::from_secs(5), Duration::from_secs(1));
        assert!(config.validate().is_err());
        assert!(RetryConfig::default().with_exponential_base(0.5).validate().is_err());
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_max_delay(
            attempt in 0u32..64,
            base_ms in 0u64..5_000,
            extra_ms in 0u64..60_000,
            exp_base in 1.0f64..4.0,
        ) {
            let config = RetryConfig::exponential(
                8,
                Duration::from_millis(base_ms),
                Duration::from_millis(base_ms + extra_ms),
            )
            .with_exponential_base(exp_base);

            let max = config.max_delay;
            prop_assert!(config.backoff_delay(attempt) <= max);

            let jittered = config.delay_for_attempt(attempt, &mut rand::thread_rng());
            prop_assert!(jittered.as_secs_f64() <= max.as_secs_f64() * 1.25 + 1e-6);
        }
    }
}
