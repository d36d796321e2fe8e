//! Bounded worker pool executing job bodies.
//!
//! Submissions go through an mpsc channel shared by N named worker threads,
//! so queued jobs start in FIFO order as workers free up. The active-job map
//! enforces single-flight per job id; an entry is removed once the job
//! reaches a terminal state, whatever the outcome.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use adpilot_core::{ensure_positive, ConfigError, ConfigResult, JobId};

use crate::context::{JobContext, JobError};
use crate::store::{JobStore, JobStoreError};
use crate::types::{JobErrorEntry, JobStatus, JobUpdate, LogLevel};

/// Unit of work executed for a job.
///
/// `Deps` carries whatever clients the body needs; the pool never looks
/// inside it.
pub trait JobBody: Send + 'static {
    type Deps: Send + 'static;

    fn execute(&self, ctx: &JobContext, deps: &Self::Deps) -> anyhow::Result<Value>;
}

/// [`JobBody`] backed by a closure.
pub struct FnBody<D, F> {
    f: F,
    _deps: PhantomData<fn(&D)>,
}

impl<D, F> FnBody<D, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _deps: PhantomData,
        }
    }
}

impl<D, F> JobBody for FnBody<D, F>
where
    D: Send + 'static,
    F: Fn(&JobContext, &D) -> anyhow::Result<Value> + Send + 'static,
{
    type Deps = D;

    fn execute(&self, ctx: &JobContext, deps: &D) -> anyhow::Result<Value> {
        (self.f)(ctx, deps)
    }
}

/// Wrap a closure as a [`JobBody`].
pub fn job_fn<D, F>(f: F) -> FnBody<D, F>
where
    D: Send + 'static,
    F: Fn(&JobContext, &D) -> anyhow::Result<Value> + Send + 'static,
{
    FnBody::new(f)
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Thread name prefix
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            thread_name: "job-worker".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        ensure_positive("workers", self.workers as u64)
    }
}

/// Worker pool error.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("job {0} is already running")]
    AlreadyRunning(JobId),
    #[error("worker pool is shutting down")]
    ShuttingDown,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub current_running: usize,
    /// Submitted but not yet picked up by a worker
    pub queued: usize,
    /// Entries in the active-job map
    pub active: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Running,
    Cancelled,
    Finished,
}

#[derive(Debug)]
struct HandleState {
    phase: Phase,
    outcome: Option<JobOutcome>,
}

#[derive(Debug)]
struct JobShared {
    id: JobId,
    token: CancellationToken,
    state: Mutex<HandleState>,
    finished: Condvar,
}

impl JobShared {
    /// Move Queued -> Running; false if the job was cancelled first.
    fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase != Phase::Queued {
            return false;
        }
        state.phase = Phase::Running;
        true
    }

    /// Move Queued -> Cancelled; false if a worker already started it.
    fn cancel_if_queued(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase != Phase::Queued {
            return false;
        }
        state.phase = Phase::Cancelled;
        true
    }

    fn finish(&self, outcome: JobOutcome) {
        let mut state = self.state.lock();
        state.phase = Phase::Finished;
        state.outcome = Some(outcome);
        self.finished.notify_all();
    }
}

/// Handle to a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl JobHandle {
    pub fn id(&self) -> &JobId {
        &self.shared.id
    }

    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.shared.state.lock().outcome.clone()
    }

    pub fn cancel_requested(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Block until the job reaches a terminal state.
    pub fn wait(&self) -> JobOutcome {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.shared.finished.wait(&mut state);
        }
    }

    /// Block up to `timeout`; `None` if the job is still in flight.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.outcome.is_none() {
            if self.shared.finished.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.outcome.clone()
    }
}

type Task = Box<dyn FnOnce(&JobContext) -> anyhow::Result<Value> + Send>;

struct Submission {
    job: Arc<JobShared>,
    config: Value,
    task: Task,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    running: usize,
    queued: usize,
}

struct PoolShared {
    store: Arc<dyn JobStore>,
    active: Mutex<HashMap<JobId, Arc<JobShared>>>,
    counters: Mutex<Counters>,
}

impl PoolShared {
    /// Remove `job` from the active map unless the id was already re-used.
    fn release(&self, job: &Arc<JobShared>) {
        let mut active = self.active.lock();
        if active.get(&job.id).is_some_and(|current| Arc::ptr_eq(current, job)) {
            active.remove(&job.id);
        }
    }

    /// Write to the store; failures are logged, never propagated to workers.
    fn record(&self, id: &JobId, update: JobUpdate) {
        if let Err(err) = self.store.update_job(id, update) {
            error!(job_id = %id, error = %err, "failed to update job record");
        }
    }

    fn log(&self, id: &JobId, level: LogLevel, message: &str, data: Option<Value>) {
        if let Err(err) = self.store.add_log(id, level, message, data) {
            error!(job_id = %id, error = %err, "failed to append job log");
        }
    }
}

/// Removes the job from the active map when dropped.
struct Finalizer<'a> {
    pool: &'a PoolShared,
    job: &'a Arc<JobShared>,
}

impl Drop for Finalizer<'_> {
    fn drop(&mut self) {
        self.pool.release(self.job);
    }
}

/// Bounded pool of worker threads running job bodies.
pub struct WorkerPool {
    config: PoolConfig,
    shared: Arc<PoolShared>,
    sender: Mutex<Option<mpsc::Sender<Submission>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Start `config.workers` threads reporting into `store`.
    pub fn new(config: PoolConfig, store: Arc<dyn JobStore>) -> Result<Self, PoolError> {
        config.validate()?;

        let (sender, receiver) = mpsc::channel::<Submission>();
        let receiver = Arc::new(Mutex::new(receiver));
        let shared = Arc::new(PoolShared {
            store,
            active: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
        });

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let receiver = receiver.clone();
            let shared = shared.clone();
            let name = format!("{}-{}", config.thread_name, index);
            let join = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(name, receiver, shared))
                .map_err(PoolError::Spawn)?;
            workers.push(join);
        }

        info!(workers = config.workers, "worker pool started");
        Ok(Self {
            config,
            shared,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.shared.store
    }

    /// Queue `body` for execution under `job_id`.
    ///
    /// Uses the existing queued record for `job_id` if there is one,
    /// otherwise creates it. Returns immediately.
    pub fn submit<B: JobBody>(
        &self,
        job_id: JobId,
        config: Value,
        deps: B::Deps,
        body: B,
    ) -> Result<JobHandle, PoolError> {
        let job = Arc::new(JobShared {
            id: job_id.clone(),
            token: CancellationToken::new(),
            state: Mutex::new(HandleState {
                phase: Phase::Queued,
                outcome: None,
            }),
            finished: Condvar::new(),
        });

        {
            let mut active = self.shared.active.lock();
            if active.contains_key(&job_id) {
                return Err(PoolError::AlreadyRunning(job_id));
            }
            active.insert(job_id.clone(), job.clone());
        }

        if let Err(err) = self.ensure_record(&job_id, &config) {
            self.shared.release(&job);
            return Err(err);
        }

        let task: Task = Box::new(move |ctx: &JobContext| body.execute(ctx, &deps));
        let submission = Submission {
            job: job.clone(),
            config,
            task,
        };

        // Counted before the send: a worker or `cancel` may take the job
        // as soon as it is in the channel.
        {
            let mut counters = self.shared.counters.lock();
            counters.submitted += 1;
            counters.queued += 1;
        }
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(submission).is_ok(),
            None => false,
        };
        if !sent {
            {
                let mut counters = self.shared.counters.lock();
                counters.submitted = counters.submitted.saturating_sub(1);
                counters.queued = counters.queued.saturating_sub(1);
            }
            self.shared.release(&job);
            return Err(PoolError::ShuttingDown);
        }
        debug!(job_id = %job_id, "job queued");
        Ok(JobHandle { shared: job })
    }

    fn ensure_record(&self, job_id: &JobId, config: &Value) -> Result<(), PoolError> {
        if self.sender.lock().is_none() {
            return Err(PoolError::ShuttingDown);
        }
        match self.shared.store.get_job(job_id)? {
            Some(job) if job.status == JobStatus::Queued => Ok(()),
            _ => {
                self.shared.store.create_job(job_id, config.clone(), None)?;
                Ok(())
            }
        }
    }

    /// Request cancellation of `job_id`.
    ///
    /// A job that has not started yet is marked cancelled and never runs;
    /// returns true in that case only. A running job just has its token
    /// set: the record is left alone and the body decides how it ends.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        let Some(job) = self.shared.active.lock().get(job_id).cloned() else {
            return false;
        };
        job.token.cancel();

        if !job.cancel_if_queued() {
            warn!(job_id = %job_id, "cancellation requested for running job");
            self.shared.log(
                job_id,
                LogLevel::Warning,
                "Cancellation requested; the job stops at its next checkpoint",
                None,
            );
            return false;
        }

        self.shared.record(
            job_id,
            JobUpdate::new()
                .status(JobStatus::Cancelled)
                .step("Cancelled by user"),
        );
        self.shared
            .log(job_id, LogLevel::Warning, "Job cancelled before start", None);
        self.shared.release(&job);
        {
            let mut counters = self.shared.counters.lock();
            counters.queued = counters.queued.saturating_sub(1);
            counters.cancelled += 1;
        }
        job.finish(JobOutcome::Cancelled);
        info!(job_id = %job_id, "job cancelled before start");
        true
    }

    pub fn is_running(&self, job_id: &JobId) -> bool {
        self.shared.active.lock().contains_key(job_id)
    }

    /// Handle for an active job.
    pub fn handle(&self, job_id: &JobId) -> Option<JobHandle> {
        self.shared
            .active
            .lock()
            .get(job_id)
            .map(|shared| JobHandle {
                shared: shared.clone(),
            })
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.shared.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> PoolStats {
        let active = self.shared.active.lock().len();
        let counters = self.shared.counters.lock();
        PoolStats {
            jobs_submitted: counters.submitted,
            jobs_completed: counters.completed,
            jobs_failed: counters.failed,
            jobs_cancelled: counters.cancelled,
            current_running: counters.running,
            queued: counters.queued,
            active,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting submissions, let queued and running jobs finish, and
    /// join the workers. Idempotent.
    pub fn shutdown(&self) {
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        drop(sender);
        info!("worker pool draining");

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
        info!("worker pool stopped");
    }
}

fn worker_loop(
    name: String,
    receiver: Arc<Mutex<mpsc::Receiver<Submission>>>,
    shared: Arc<PoolShared>,
) {
    debug!(worker = %name, "worker started");
    loop {
        let next = receiver.lock().recv();
        let Ok(submission) = next else {
            break;
        };
        run_submission(&shared, submission);
    }
    debug!(worker = %name, "worker stopped");
}

fn run_submission(pool: &PoolShared, submission: Submission) {
    let Submission { job, config, task } = submission;

    if !job.begin() {
        debug!(job_id = %job.id, "skipping job cancelled before start");
        return;
    }
    {
        let mut counters = pool.counters.lock();
        counters.queued = counters.queued.saturating_sub(1);
        counters.running += 1;
    }

    let outcome = {
        let _finalizer = Finalizer { pool, job: &job };
        execute_job(pool, &job, config, task)
    };

    {
        let mut counters = pool.counters.lock();
        counters.running = counters.running.saturating_sub(1);
        match outcome {
            JobOutcome::Completed => counters.completed += 1,
            JobOutcome::Failed(_) => counters.failed += 1,
            JobOutcome::Cancelled => counters.cancelled += 1,
        }
    }
    job.finish(outcome);
}

fn execute_job(pool: &PoolShared, job: &Arc<JobShared>, config: Value, task: Task) -> JobOutcome {
    let id = &job.id;

    let start = JobUpdate::new()
        .status(JobStatus::Running)
        .progress(0.0)
        .step("Starting");
    if let Err(err) = pool.store.update_job(id, start) {
        error!(job_id = %id, error = %err, "could not mark job running");
        return JobOutcome::Failed(err.to_string());
    }
    pool.log(id, LogLevel::Info, "Job started", Some(json!({ "config": config })));
    info!(job_id = %id, "job started");

    let started = Instant::now();
    let ctx = JobContext::new(id.clone(), config, pool.store.clone(), job.token.clone());
    let result = panic::catch_unwind(AssertUnwindSafe(|| task(&ctx)));
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(results)) => {
            pool.record(
                id,
                JobUpdate::new()
                    .status(JobStatus::Completed)
                    .progress(100.0)
                    .step("Completed")
                    .results(results),
            );
            pool.log(
                id,
                LogLevel::Success,
                "Job completed",
                Some(json!({ "item_failures": ctx.item_failures() })),
            );
            info!(job_id = %id, elapsed_ms, "job completed");
            JobOutcome::Completed
        }
        Ok(Err(err)) if JobError::is_cancellation(&err) => {
            pool.record(
                id,
                JobUpdate::new()
                    .status(JobStatus::Cancelled)
                    .step("Cancelled by user"),
            );
            pool.log(id, LogLevel::Warning, "Job cancelled", None);
            info!(job_id = %id, elapsed_ms, "job stopped after cancellation");
            JobOutcome::Cancelled
        }
        Ok(Err(err)) => {
            let message = format!("{err:#}");
            fail(pool, id, message, Some(format!("{err:?}")), elapsed_ms)
        }
        Err(payload) => {
            let message = format!("job body panicked: {}", panic_message(payload.as_ref()));
            fail(pool, id, message, None, elapsed_ms)
        }
    }
}

fn fail(
    pool: &PoolShared,
    id: &JobId,
    message: String,
    detail: Option<String>,
    elapsed_ms: u64,
) -> JobOutcome {
    let mut entry = JobErrorEntry::new(message.clone());
    if let Some(detail) = &detail {
        entry = entry.with_detail(detail.clone());
    }
    pool.record(
        id,
        JobUpdate::new()
            .status(JobStatus::Failed)
            .step(format!("Error: {message}"))
            .error(entry),
    );
    pool.log(
        id,
        LogLevel::Error,
        &format!("Job failed: {message}"),
        Some(json!({ "error": message, "detail": detail })),
    );
    error!(job_id = %id, elapsed_ms, error = %message, "job failed");
    JobOutcome::Failed(message)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
