//! Shared building blocks for the job and resilience crates.
//!
//! This crate contains only plain types (no threads, no I/O).

pub mod error;
pub mod id;

pub use error::{ensure_positive, ConfigError, ConfigResult};
pub use id::JobId;
