//! Call statistics.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Cumulative counters for calls made through a breaker or retry handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub total_retries: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl CallStats {
    pub fn record_success(&mut self) {
        self.total_calls += 1;
        self.successful_calls += 1;
    }

    pub fn record_failure(&mut self, error: &dyn Display) {
        self.total_calls += 1;
        self.failed_calls += 1;
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(Utc::now());
    }

    pub fn record_retry(&mut self) {
        self.total_retries += 1;
    }

    /// Fraction of calls that succeeded; `1.0` before the first call.
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.successful_calls as f64 / self.total_calls as f64
    }
}
