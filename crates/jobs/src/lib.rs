//! Background job system: records, storage and a bounded worker pool.
//!
//! ## Design
//!
//! - Job records follow queued -> running -> completed / failed / cancelled
//!   and are immutable once terminal
//! - At most one execution per job id is in flight (single-flight)
//! - Cancellation is cooperative: bodies poll a token between steps
//! - A failing or panicking body becomes a recorded job failure and never
//!   takes a worker down
//!
//! ## Components
//!
//! - `Job`, `JobUpdate`, `JobLogEntry`: record types
//! - `JobStore`: persistence boundary (in-memory implementation included)
//! - `JobBody` / `JobContext`: what a job runs and what it is handed
//! - `WorkerPool`: executes bodies on N threads

pub mod context;
pub mod pool;
pub mod store;
pub mod types;

pub use context::{JobContext, JobError};
pub use pool::{
    job_fn, FnBody, JobBody, JobHandle, JobOutcome, PoolConfig, PoolError, PoolStats, WorkerPool,
};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{Job, JobErrorEntry, JobLogEntry, JobStatus, JobUpdate, LogLevel};

pub use adpilot_core::JobId;
