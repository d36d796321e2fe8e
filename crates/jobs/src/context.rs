//! Execution context handed to a running job body.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use adpilot_core::JobId;

use crate::store::{JobStore, JobStoreError};
use crate::types::{JobUpdate, LogLevel};

/// Error a job body returns to stop early.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Cancellation was requested and observed at a checkpoint.
    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    /// Whether `err` (or anything in its chain) is a cancellation.
    pub fn is_cancellation(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref::<JobError>(), Some(JobError::Cancelled)))
    }
}

/// Per-job capability object: identity, input, cancellation and progress
/// reporting.
///
/// Bodies are expected to call [`checkpoint`](Self::checkpoint) between
/// pipeline steps; nothing interrupts a body that never checks.
pub struct JobContext {
    job_id: JobId,
    config: Value,
    store: Arc<dyn JobStore>,
    token: CancellationToken,
    progress: Mutex<f64>,
    item_failures: AtomicUsize,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("cancelled", &self.token.is_cancelled())
            .field("progress", &*self.progress.lock())
            .finish()
    }
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        config: Value,
        store: Arc<dyn JobStore>,
        token: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            config,
            store,
            token,
            progress: Mutex::new(0.0),
            item_failures: AtomicUsize::new(0),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A clone of the job's cancellation token, for handing to helpers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Return `Err(JobError::Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.token.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    /// Record progress and the current step.
    ///
    /// Progress is clamped into [0, 100] and never moves backwards; a lower
    /// value only updates the step.
    pub fn report_progress(&self, percent: f64, step: impl Into<String>) -> Result<(), JobStoreError> {
        let mut progress = self.progress.lock();
        let next = if percent.is_nan() {
            *progress
        } else {
            progress.max(percent.clamp(0.0, 100.0))
        };

        self.store
            .update_job(&self.job_id, JobUpdate::new().progress(next).step(step))?;
        *progress = next;
        Ok(())
    }

    pub fn progress(&self) -> f64 {
        *self.progress.lock()
    }

    pub fn log(&self, level: LogLevel, message: &str, data: Option<Value>) -> Result<(), JobStoreError> {
        self.store.add_log(&self.job_id, level, message, data)
    }

    /// Record a failed item without aborting the job.
    pub fn record_item_failure(&self, message: &str, data: Option<Value>) -> Result<(), JobStoreError> {
        let failures = self.item_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(job_id = %self.job_id, failures, error = message, "job item failed");

        let data = match data {
            Some(data) => json!({ "item_failures": failures, "data": data }),
            None => json!({ "item_failures": failures }),
        };
        self.store
            .add_log(&self.job_id, LogLevel::Error, message, Some(data))
    }

    pub fn item_failures(&self) -> usize {
        self.item_failures.load(Ordering::Relaxed)
    }
}
