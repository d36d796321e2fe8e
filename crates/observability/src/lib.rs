//! Tracing/logging setup shared by every binary and test harness.

/// Initialize process-wide observability (JSON tracing, `RUST_LOG` filter).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

pub use self::tracing::{init_pretty, init_with_filter};

/// Tracing configuration (filters, layers).
pub mod tracing;
