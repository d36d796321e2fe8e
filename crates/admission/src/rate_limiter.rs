//! Sliding-window rate limiter keyed by caller identity.
//!
//! Checks run in order and the first violation wins:
//! 1. cooldown since the identity's previous admitted request
//! 2. requests in the last 60s for the identity
//! 3. requests in the last hour for the identity
//! 4. requests in the last 60s across all identities
//!
//! Timestamps older than an hour are pruned lazily on each check.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use adpilot_core::{ensure_positive, ConfigError, ConfigResult};

use crate::identity::Identity;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Rate limit thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// Minimum spacing between two admitted requests of one identity
    pub cooldown: Duration,
    pub global_requests_per_minute: u32,
    /// Reported in stats only
    pub global_requests_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 20,
            requests_per_hour: 200,
            cooldown: Duration::from_secs(1),
            global_requests_per_minute: 100,
            global_requests_per_hour: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn with_requests_per_minute(mut self, limit: u32) -> Self {
        self.requests_per_minute = limit;
        self
    }

    pub fn with_requests_per_hour(mut self, limit: u32) -> Self {
        self.requests_per_hour = limit;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_global_requests_per_minute(mut self, limit: u32) -> Self {
        self.global_requests_per_minute = limit;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        ensure_positive("requests_per_minute", self.requests_per_minute.into())?;
        ensure_positive("requests_per_hour", self.requests_per_hour.into())?;
        ensure_positive("global_requests_per_minute", self.global_requests_per_minute.into())?;
        if self.requests_per_minute > self.requests_per_hour {
            return Err(ConfigError::inconsistent(
                "requests_per_minute",
                format!(
                    "{} per minute exceeds {} per hour",
                    self.requests_per_minute, self.requests_per_hour
                ),
            ));
        }
        Ok(())
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    Cooldown,
    PerMinute { limit: u32 },
    PerHour { limit: u32 },
    GlobalBusy,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Cooldown => write!(f, "Too many requests. Please wait."),
            DenyReason::PerMinute { limit } => write!(f, "Rate limit exceeded ({limit}/min)"),
            DenyReason::PerHour { limit } => write!(f, "Hourly limit exceeded ({limit}/hour)"),
            DenyReason::GlobalBusy => write!(f, "System is busy. Please try again later."),
        }
    }
}

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied {
        reason: DenyReason,
        retry_after: Duration,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }

    pub fn reason(&self) -> Option<DenyReason> {
        match self {
            RateDecision::Allowed => None,
            RateDecision::Denied { reason, .. } => Some(*reason),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateDecision::Allowed => None,
            RateDecision::Denied { retry_after, .. } => Some(*retry_after),
        }
    }
}

/// Per-identity counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStats {
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub limit_per_minute: u32,
    pub limit_per_hour: u32,
}

/// Counters across every identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalStats {
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    pub active_identities: usize,
    pub limit_per_minute: u32,
    pub limit_per_hour: u32,
    pub blocked_requests: u64,
}

/// Ordered admission timestamps, oldest first.
#[derive(Debug, Default)]
struct Window {
    requests: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.requests.front() {
            if now.saturating_duration_since(oldest) < HOUR {
                break;
            }
            self.requests.pop_front();
        }
    }

    fn count_within(&self, now: Instant, span: Duration) -> usize {
        self.requests
            .iter()
            .rev()
            .take_while(|&&at| now.saturating_duration_since(at) < span)
            .count()
    }

    fn oldest(&self) -> Option<Instant> {
        self.requests.front().copied()
    }

    fn record(&mut self, now: Instant) {
        self.requests.push_back(now);
    }
}

#[derive(Debug, Default)]
struct IdentityState {
    window: Window,
    last_request: Option<Instant>,
    total_requests: u64,
    blocked_requests: u64,
}

#[derive(Debug, Default)]
struct LimiterState {
    identities: HashMap<String, IdentityState>,
    global: Window,
    blocked_requests: u64,
}

/// Layered sliding-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether `identity` may submit work now; admitted requests are
    /// recorded.
    pub fn check(&self, identity: &Identity) -> RateDecision {
        self.check_at(identity, Instant::now())
    }

    /// [`check`](Self::check) evaluated at `now`.
    pub fn check_at(&self, identity: &Identity, now: Instant) -> RateDecision {
        let key = identity.key();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let entry = state.identities.entry(key.clone()).or_default();
        entry.window.prune(now);
        state.global.prune(now);

        let denial = self.evaluate(entry, &state.global, now);
        match denial {
            Some((reason, retry_after)) => {
                entry.blocked_requests += 1;
                state.blocked_requests += 1;
                debug!(
                    identity = %key,
                    reason = %reason,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "request denied"
                );
                RateDecision::Denied { reason, retry_after }
            }
            None => {
                entry.window.record(now);
                entry.last_request = Some(now);
                entry.total_requests += 1;
                state.global.record(now);
                debug!(identity = %key, "request admitted");
                RateDecision::Allowed
            }
        }
    }

    fn evaluate(
        &self,
        entry: &IdentityState,
        global: &Window,
        now: Instant,
    ) -> Option<(DenyReason, Duration)> {
        if let Some(last) = entry.last_request {
            let since_last = now.saturating_duration_since(last);
            if since_last < self.config.cooldown {
                return Some((DenyReason::Cooldown, self.config.cooldown - since_last));
            }
        }

        if entry.window.count_within(now, MINUTE) >= self.config.requests_per_minute as usize {
            let limit = self.config.requests_per_minute;
            return Some((DenyReason::PerMinute { limit }, MINUTE));
        }

        if entry.window.count_within(now, HOUR) >= self.config.requests_per_hour as usize {
            let limit = self.config.requests_per_hour;
            let retry_after = entry
                .window
                .oldest()
                .map(|oldest| HOUR.saturating_sub(now.saturating_duration_since(oldest)))
                .unwrap_or(HOUR);
            return Some((DenyReason::PerHour { limit }, retry_after));
        }

        if global.count_within(now, MINUTE) >= self.config.global_requests_per_minute as usize {
            return Some((DenyReason::GlobalBusy, MINUTE));
        }

        None
    }

    pub fn get_user_stats(&self, identity: &Identity) -> UserStats {
        self.user_stats_at(identity, Instant::now())
    }

    pub fn user_stats_at(&self, identity: &Identity, now: Instant) -> UserStats {
        let mut state = self.state.lock();
        let (minute, hour, total, blocked) = match state.identities.get_mut(&identity.key()) {
            Some(entry) => {
                entry.window.prune(now);
                (
                    entry.window.count_within(now, MINUTE),
                    entry.window.count_within(now, HOUR),
                    entry.total_requests,
                    entry.blocked_requests,
                )
            }
            None => (0, 0, 0, 0),
        };

        UserStats {
            requests_last_minute: minute,
            requests_last_hour: hour,
            total_requests: total,
            blocked_requests: blocked,
            limit_per_minute: self.config.requests_per_minute,
            limit_per_hour: self.config.requests_per_hour,
        }
    }

    pub fn get_global_stats(&self) -> GlobalStats {
        self.global_stats_at(Instant::now())
    }

    pub fn global_stats_at(&self, now: Instant) -> GlobalStats {
        let mut state = self.state.lock();
        state.global.prune(now);

        GlobalStats {
            requests_last_minute: state.global.count_within(now, MINUTE),
            requests_last_hour: state.global.count_within(now, HOUR),
            active_identities: state.identities.len(),
            limit_per_minute: self.config.global_requests_per_minute,
            limit_per_hour: self.config.global_requests_per_hour,
            blocked_requests: state.blocked_requests,
        }
    }

    /// Drop identities with no request in the last hour.
    ///
    /// Returns how many were removed.
    pub fn purge_idle(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let before = state.identities.len();
        state.identities.retain(|_, entry| {
            entry.window.prune(now);
            !entry.window.requests.is_empty()
        });
        before - state.identities.len()
    }
}
