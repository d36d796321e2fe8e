//! Engine configuration and environment loading.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use adpilot_admission::{QueueConfig, RateLimitConfig};
use adpilot_core::{ConfigError, ConfigResult};
use adpilot_jobs::PoolConfig;
use adpilot_resilience::{CircuitBreakerConfig, RetryConfig};

pub const ENV_WORKERS: &str = "ADPILOT_WORKERS";
pub const ENV_MAX_CONCURRENT: &str = "ADPILOT_MAX_CONCURRENT";
pub const ENV_QUEUE_TIMEOUT_SECS: &str = "ADPILOT_QUEUE_TIMEOUT_SECS";
pub const ENV_RATE_PER_MINUTE: &str = "ADPILOT_RATE_PER_MINUTE";
pub const ENV_RATE_PER_HOUR: &str = "ADPILOT_RATE_PER_HOUR";
pub const ENV_COOLDOWN_MS: &str = "ADPILOT_COOLDOWN_MS";
pub const ENV_GLOBAL_PER_MINUTE: &str = "ADPILOT_GLOBAL_PER_MINUTE";

/// Settings for every service owned by [`AppContext`](crate::AppContext).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub rate_limit: RateLimitConfig,
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl EngineConfig {
    /// Defaults overlaid with `ADPILOT_*` environment variables.
    ///
    /// Invalid values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.overlay(&lookup, |key, err| {
            warn!(key, error = %err, "ignoring invalid configuration value");
        });
        config
    }

    /// Like [`from_lookup`](Self::from_lookup) but fails on the first invalid
    /// value, and validates the result.
    pub fn try_from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let mut first_error = None;
        config.overlay(&lookup, |_, err| {
            first_error.get_or_insert(err);
        });
        if let Some(err) = first_error {
            return Err(err);
        }
        config.validate()?;
        Ok(config)
    }

    fn overlay<F, E>(&mut self, lookup: &F, mut on_error: E)
    where
        F: Fn(&str) -> Option<String>,
        E: FnMut(&str, ConfigError),
    {
        let mut apply = |key: &'static str, set: &mut dyn FnMut(&str) -> ConfigResult<()>| {
            if let Some(raw) = lookup(key) {
                if let Err(err) = set(raw.trim()) {
                    on_error(key, err);
                }
            }
        };

        apply(ENV_WORKERS, &mut |raw| {
            self.pool.workers = parse(ENV_WORKERS, raw)?;
            Ok(())
        });
        apply(ENV_MAX_CONCURRENT, &mut |raw| {
            self.queue.max_concurrent = parse(ENV_MAX_CONCURRENT, raw)?;
            Ok(())
        });
        apply(ENV_QUEUE_TIMEOUT_SECS, &mut |raw| {
            self.queue.acquire_timeout = Duration::from_secs(parse(ENV_QUEUE_TIMEOUT_SECS, raw)?);
            Ok(())
        });
        apply(ENV_RATE_PER_MINUTE, &mut |raw| {
            self.rate_limit.requests_per_minute = parse(ENV_RATE_PER_MINUTE, raw)?;
            Ok(())
        });
        apply(ENV_RATE_PER_HOUR, &mut |raw| {
            self.rate_limit.requests_per_hour = parse(ENV_RATE_PER_HOUR, raw)?;
            Ok(())
        });
        apply(ENV_COOLDOWN_MS, &mut |raw| {
            self.rate_limit.cooldown = Duration::from_millis(parse(ENV_COOLDOWN_MS, raw)?);
            Ok(())
        });
        apply(ENV_GLOBAL_PER_MINUTE, &mut |raw| {
            self.rate_limit.global_requests_per_minute = parse(ENV_GLOBAL_PER_MINUTE, raw)?;
            Ok(())
        });
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.rate_limit.validate()?;
        self.queue.validate()?;
        self.pool.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> ConfigResult<T> {
    raw.parse().map_err(|_| ConfigError::unparsable(key, raw))
}
