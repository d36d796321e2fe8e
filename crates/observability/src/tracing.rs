//! Tracing/logging initialization.
//!
//! Worker threads, breakers and admission checks all log through the `tracing`
//! facade; this module only decides where those events go.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize JSON logs for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_filter(DEFAULT_FILTER);
}

/// Like [`init`], but with an explicit fallback directive used when `RUST_LOG`
/// is unset (e.g. `"adpilot_jobs=debug,info"`).
pub fn init_with_filter(default: &str) {
    // JSON logs + timestamps, configurable via RUST_LOG.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or(default))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}

/// Human-readable output for local runs and test debugging.
pub fn init_pretty() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or(DEFAULT_FILTER))
        .with_thread_names(true)
        .compact()
        .try_init();
}
