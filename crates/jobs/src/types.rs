//! Job records and log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use adpilot_core::JobId;

use crate::store::JobStoreError;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for a worker
    Queued,
    /// A worker is executing the body
    Running,
    /// Body returned successfully
    Completed,
    /// Body returned an error or panicked
    Failed,
    /// Cancelled before start, or stopped at a checkpoint after cancellation
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a record in `self` may move to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Cancelled) | (Running, Completed | Failed | Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Failure recorded against a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobErrorEntry {
    pub message: String,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobErrorEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A background job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Who the job belongs to (user identifier or account id)
    pub owner: Option<String>,
    pub status: JobStatus,
    /// Percentage in [0, 100]
    pub progress: f64,
    pub current_step: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Job-specific output
    pub results: Value,
    pub errors: Vec<JobErrorEntry>,
    /// Configuration the job was submitted with
    pub config_snapshot: Value,
}

impl Job {
    /// Create a queued job.
    ///
    /// Without an explicit owner, the config's `customerId` is used.
    pub fn new(id: JobId, config: Value, owner: Option<&str>) -> Self {
        let owner = owner.map(str::to_string).or_else(|| owner_from_config(&config));
        Self {
            id,
            owner,
            status: JobStatus::Queued,
            progress: 0.0,
            current_step: "Queued".to_string(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            results: Value::Object(Default::default()),
            errors: Vec::new(),
            config_snapshot: config,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply `update`, enforcing the lifecycle rules.
    ///
    /// Terminal records accept no further updates. Progress never decreases
    /// and is forced to 100 on completion. Entering `running` stamps
    /// `started_at`, entering a terminal status stamps `completed_at`, unless
    /// the update carries its own timestamps.
    pub fn apply(&mut self, update: JobUpdate) -> Result<(), JobStoreError> {
        if self.status.is_terminal() {
            return Err(JobStoreError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: update.status.unwrap_or(self.status),
            });
        }
        if let Some(next) = update.status {
            if next != self.status && !self.status.can_transition_to(next) {
                return Err(JobStoreError::InvalidTransition {
                    id: self.id.clone(),
                    from: self.status,
                    to: next,
                });
            }
        }

        let now = Utc::now();
        if let Some(next) = update.status {
            if next != self.status {
                if next == JobStatus::Running && self.started_at.is_none() {
                    self.started_at = Some(update.started_at.unwrap_or(now));
                }
                if next.is_terminal() {
                    self.completed_at = Some(update.completed_at.unwrap_or(now));
                }
            }
            self.status = next;
        }
        if let Some(started_at) = update.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }

        if let Some(progress) = update.progress {
            self.progress = self.progress.max(progress.clamp(0.0, 100.0));
        }
        if self.status == JobStatus::Completed {
            self.progress = 100.0;
        }

        if let Some(step) = update.current_step {
            self.current_step = step;
        }
        if let Some(results) = update.results {
            self.results = results;
        }
        self.errors.extend(update.errors);
        Ok(())
    }
}

fn owner_from_config(config: &Value) -> Option<String> {
    match config.get("customerId")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Partial update of a [`Job`]; unset fields are left unchanged and errors
/// are appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub current_step: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub results: Option<Value>,
    pub errors: Vec<JobErrorEntry>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn results(mut self, results: Value) -> Self {
        self.results = Some(results);
        self
    }

    pub fn error(mut self, error: JobErrorEntry) -> Self {
        self.errors.push(error);
        self
    }
}

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "SUCCESS",
        };
        f.write_str(s)
    }
}

/// Append-only log line attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub data: Option<Value>,
}

impl JobLogEntry {
    pub fn new(job_id: JobId, level: LogLevel, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            level,
            message: message.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn queued() -> Job {
        Job::new(JobId::new("job-1"), json!({"customerId": "123"}), None)
    }

    #[test]
    fn new_job_is_queued_and_owned_by_customer() {
        let job = queued();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.owner.as_deref(), Some("123"));
        assert_eq!(job.progress, 0.0);
        assert!(job.started_at.is_none());

        let explicit = Job::new(JobId::new("job-2"), json!({"customerId": "123"}), Some("ops@example.com"));
        assert_eq!(explicit.owner.as_deref(), Some("ops@example.com"));
    }

    #[test]
    fn job_lifecycle() {
        let mut job = queued();

        job.apply(JobUpdate::new().status(JobStatus::Running).step("Loading keywords"))
            .unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());

        job.apply(JobUpdate::new().progress(40.0)).unwrap();
        job.apply(
            JobUpdate::new()
                .status(JobStatus::Completed)
                .results(json!({"ads_created": 4})),
        )
        .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert!(job.completed_at.is_some());
        assert_eq!(job.results["ads_created"], 4);
    }

    #[test]
    fn terminal_job_rejects_updates() {
        let mut job = queued();
        job.apply(JobUpdate::new().status(JobStatus::Running)).unwrap();
        job.apply(
            JobUpdate::new()
                .status(JobStatus::Failed)
                .error(JobErrorEntry::new("quota exceeded")),
        )
        .unwrap();

        let err = job
            .apply(JobUpdate::new().status(JobStatus::Completed))
            .unwrap_err();
        assert!(matches!(
            err,
            JobStoreError::InvalidTransition {
                from: JobStatus::Failed,
                to: JobStatus::Completed,
                ..
            }
        ));
        assert!(job.apply(JobUpdate::new().progress(50.0)).is_err());
        assert_eq!(job.errors.len(), 1);
    }

    #[test]
    fn queued_job_can_be_cancelled_without_starting() {
        let mut job = queued();
        job.apply(JobUpdate::new().status(JobStatus::Cancelled)).unwrap();
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn queued_job_cannot_skip_running() {
        let mut job = queued();
        assert!(job.apply(JobUpdate::new().status(JobStatus::Completed)).is_err());
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn status_and_level_serialize_like_the_store() {
        assert_eq!(serde_json::to_string(&JobStatus::Cancelled).unwrap(), "\"cancelled\"");
        assert_eq!(serde_json::to_string(&LogLevel::Warning).unwrap(), "\"WARNING\"");
        assert_eq!(LogLevel::Success.to_string(), "SUCCESS");
    }

    proptest! {
        #[test]
        fn progress_never_decreases(reports in proptest::collection::vec(-50.0f64..150.0, 1..40)) {
            let mut job = queued();
            job.apply(JobUpdate::new().status(JobStatus::Running)).unwrap();

            let mut last = job.progress;
            for p in reports {
                job.apply(JobUpdate::new().progress(p)).unwrap();
                prop_assert!(job.progress >= last);
                prop_assert!((0.0..=100.0).contains(&job.progress));
                last = job.progress;
            }
        }
    }
}
