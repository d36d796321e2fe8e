//! Engine wiring: one [`AppContext`] owns the rate limiter, admission queue,
//! circuit breakers, job store and worker pool, built once from an
//! [`EngineConfig`].
//!
//! Submission path: rate limit -> queue slot -> job record -> worker pool.
//! The queue slot is held only until the job is queued; the pool bounds
//! execution concurrency on its own.

pub mod config;
pub mod context;

pub use config::EngineConfig;
pub use context::{AdmissionError, AppContext, HealthReport};
