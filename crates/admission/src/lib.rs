//! Admission control for inbound work.
//!
//! Two independent gates, checked in order by the caller:
//!
//! - `RateLimiter`: layered sliding windows per caller identity (cooldown,
//!   per-minute, per-hour) plus a global per-minute ceiling. Never blocks and
//!   never errors; a denial is an ordinary `RateDecision`.
//! - `RequestQueue`: counting semaphore bounding how many callers hold a slot
//!   at once, with a bounded wait.

pub mod identity;
pub mod rate_limiter;
pub mod request_queue;

pub use identity::Identity;
pub use rate_limiter::{
    DenyReason, GlobalStats, RateDecision, RateLimitConfig, RateLimiter, UserStats,
};
pub use request_queue::{QueueConfig, QueueSlot, QueueStatus, RequestQueue};
