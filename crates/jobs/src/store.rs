//! Job storage implementations.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use adpilot_core::JobId;

use super::types::{Job, JobLogEntry, JobStatus, JobUpdate, LogLevel};

/// Job store abstraction.
///
/// Implementations must be safe to call from every worker thread at once.
pub trait JobStore: Send + Sync {
    /// Create a queued job record.
    ///
    /// A finished record with the same id is replaced (a re-run); a queued or
    /// running one is not.
    fn create_job(&self, id: &JobId, config: Value, owner: Option<&str>) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    fn get_job(&self, id: &JobId) -> Result<Option<Job>, JobStoreError>;

    /// Apply a partial update, returning the updated record.
    fn update_job(&self, id: &JobId, update: JobUpdate) -> Result<Job, JobStoreError>;

    /// Append a log entry to a job.
    fn add_log(
        &self,
        id: &JobId,
        level: LogLevel,
        message: &str,
        data: Option<Value>,
    ) -> Result<(), JobStoreError>;

    /// The newest `limit` log entries of a job, newest first.
    fn get_job_logs(&self, id: &JobId, limit: usize) -> Result<Vec<JobLogEntry>, JobStoreError>;

    /// Jobs filtered by owner and status, newest first.
    fn list_jobs(
        &self,
        owner: Option<&str>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Delete finished jobs (and their logs) completed before `older_than`.
    ///
    /// Returns the number of jobs removed.
    fn cleanup_finished(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id}: invalid transition from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    logs: RwLock<HashMap<JobId, Vec<JobLogEntry>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

impl JobStore for InMemoryJobStore {
    fn create_job(&self, id: &JobId, config: Value, owner: Option<&str>) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write();
        if let Some(existing) = jobs.get(id) {
            if !existing.is_terminal() {
                return Err(JobStoreError::AlreadyExists(id.clone()));
            }
        }
        let job = Job::new(id.clone(), config, owner);
        if jobs.insert(id.clone(), job.clone()).is_some() {
            // A re-run starts with an empty log.
            self.logs.write().remove(id);
        }
        Ok(job)
    }

    fn get_job(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().get(id).cloned())
    }

    fn update_job(&self, id: &JobId, update: JobUpdate) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
        job.apply(update)?;
        Ok(job.clone())
    }

    fn add_log(
        &self,
        id: &JobId,
        level: LogLevel,
        message: &str,
        data: Option<Value>,
    ) -> Result<(), JobStoreError> {
        if !self.jobs.read().contains_key(id) {
            return Err(JobStoreError::NotFound(id.clone()));
        }
        self.logs
            .write()
            .entry(id.clone())
            .or_default()
            .push(JobLogEntry::new(id.clone(), level, message, data));
        Ok(())
    }

    fn get_job_logs(&self, id: &JobId, limit: usize) -> Result<Vec<JobLogEntry>, JobStoreError> {
        let logs = self.logs.read();
        Ok(logs
            .get(id)
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn list_jobs(
        &self,
        owner: Option<&str>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                owner.is_none_or(|o| j.owner.as_deref() == Some(o))
                    && status.is_none_or(|s| j.status == s)
            })
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    fn cleanup_finished(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut jobs = self.jobs.write();
        let expired: Vec<JobId> = jobs
            .values()
            .filter(|j| j.is_terminal() && j.completed_at.is_some_and(|at| at < older_than))
            .map(|j| j.id.clone())
            .collect();

        let mut logs = self.logs.write();
        for id in &expired {
            jobs.remove(id);
            logs.remove(id);
        }
        Ok(expired.len())
    }
}
