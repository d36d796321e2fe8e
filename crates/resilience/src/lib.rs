//! Resilience primitives for calls into flaky external dependencies.
//!
//! ## Components
//!
//! - `CircuitBreaker`: per-dependency CLOSED / OPEN / HALF_OPEN state machine
//! - `CircuitBreakerRegistry`: lazily creates and keeps one breaker per name
//! - `RetryHandler`: bounded retries with exponential backoff and jitter,
//!   optionally routed through a breaker
//! - `CallStats`: call counters shared by breakers and retry handlers
//!
//! Breakers fail fast and never block; the retry handler sleeps on the calling
//! thread between attempts.

pub mod circuit_breaker;
pub mod registry;
pub mod retry;
pub mod stats;

pub use circuit_breaker::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitOpenError,
    CircuitState,
};
pub use registry::{retry_with_breaker, CircuitBreakerRegistry, GITHUB, GOOGLE_ADS, OPENAI};
pub use retry::{terminal, Classify, ErrorClass, RetryConfig, RetryError, RetryHandler, Terminal};
pub use stats::CallStats;
