//! Application context owning every engine service.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use adpilot_admission::{
    DenyReason, GlobalStats, Identity, QueueStatus, RateDecision, RateLimiter, RequestQueue,
};
use adpilot_core::JobId;
use adpilot_jobs::{
    JobBody, JobHandle, JobStatus, JobStore, JobStoreError, JobUpdate, PoolError, PoolStats,
    WorkerPool,
};
use adpilot_resilience::{
    retry_with_breaker, CircuitBreakerRegistry, CircuitBreakerStatus, RetryHandler,
};

use crate::config::EngineConfig;

/// Retry hint returned with a queue timeout.
const QUEUE_RETRY_HINT: Duration = Duration::from_secs(60);

/// Why a submission was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("{reason}")]
    RateLimited {
        reason: DenyReason,
        retry_after: Duration,
    },
    #[error("no admission slot available after {waited:?}")]
    QueueTimeout { waited: Duration },
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl AdmissionError {
    /// Suggested wait before trying again, for denials that are expected to
    /// clear on their own.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdmissionError::RateLimited { retry_after, .. } => Some(*retry_after),
            AdmissionError::QueueTimeout { .. } => Some(QUEUE_RETRY_HINT),
            AdmissionError::Store(_) | AdmissionError::Pool(_) => None,
        }
    }

    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            AdmissionError::RateLimited { .. } | AdmissionError::QueueTimeout { .. }
        )
    }
}

/// Snapshot of every service, for a health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub queue: QueueStatus,
    pub breakers: BTreeMap<String, CircuitBreakerStatus>,
    pub rate: GlobalStats,
    pub pool: PoolStats,
}

/// Services created once at startup and shared by reference.
pub struct AppContext {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    rate_limiter: RateLimiter,
    queue: RequestQueue,
    breakers: CircuitBreakerRegistry,
    pool: WorkerPool,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .field("rate_limiter", &self.rate_limiter)
            .field("queue", &self.queue)
            .field("breakers", &self.breakers)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// Build every service from `config`; starts the worker threads.
    pub fn new(config: EngineConfig, store: Arc<dyn JobStore>) -> Result<Self, PoolError> {
        config.validate()?;

        let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone());
        breakers.register_known_dependencies();

        let pool = WorkerPool::new(config.pool.clone(), store.clone())?;

        info!(
            workers = config.pool.workers,
            max_concurrent = config.queue.max_concurrent,
            "engine started"
        );
        Ok(Self {
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            queue: RequestQueue::from_config(&config.queue),
            breakers,
            pool,
            store,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Retry handler with the engine retry settings, bound to the breaker
    /// for `dependency`.
    pub fn retry_for(&self, dependency: &str) -> RetryHandler {
        retry_with_breaker(&self.breakers, dependency, self.config.retry.clone())
    }

    /// Admit a unit of work and hand it to the pool.
    ///
    /// Rate limit, then a queue slot (held only until the job is queued),
    /// then the job record, then submission. Returns as soon as the job is
    /// queued.
    pub fn admit_and_submit<B: JobBody>(
        &self,
        identity: &Identity,
        job_id: JobId,
        config: Value,
        deps: B::Deps,
        body: B,
    ) -> Result<JobHandle, AdmissionError> {
        if let RateDecision::Denied {
            reason,
            retry_after,
        } = self.rate_limiter.check(identity)
        {
            debug!(job_id = %job_id, reason = %reason, "submission rate limited");
            return Err(AdmissionError::RateLimited {
                reason,
                retry_after,
            });
        }

        let waiting_since = Instant::now();
        let Some(_slot) = self.queue.acquire_slot(self.config.queue.acquire_timeout) else {
            let waited = waiting_since.elapsed();
            warn!(job_id = %job_id, waited_ms = waited.as_millis() as u64, "admission queue timed out");
            return Err(AdmissionError::QueueTimeout { waited });
        };

        if self.pool.is_running(&job_id) {
            return Err(PoolError::AlreadyRunning(job_id).into());
        }

        let owner = identity.user_id.as_deref().or(identity.account_id.as_deref());
        self.store.create_job(&job_id, config.clone(), owner)?;

        match self.pool.submit(job_id.clone(), config, deps, body) {
            Ok(handle) => {
                info!(job_id = %job_id, "job admitted");
                Ok(handle)
            }
            // Another submission of the same id won the race and owns the
            // record now.
            Err(err @ PoolError::AlreadyRunning(_)) => Err(err.into()),
            Err(err) => {
                let rejected = JobUpdate::new()
                    .status(JobStatus::Cancelled)
                    .step(format!("Rejected: {err}"));
                if let Err(store_err) = self.store.update_job(&job_id, rejected) {
                    warn!(job_id = %job_id, error = %store_err, "could not mark rejected job");
                }
                Err(err.into())
            }
        }
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            queue: self.queue.status(),
            breakers: self.breakers.all_stats(),
            rate: self.rate_limiter.get_global_stats(),
            pool: self.pool.stats(),
        }
    }

    /// Stop accepting jobs and wait for queued and running ones to finish.
    pub fn shutdown(&self) {
        info!("engine shutting down");
        self.pool.shutdown();
    }
}
