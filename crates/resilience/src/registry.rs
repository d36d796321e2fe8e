//! Named circuit breakers, one per external dependency.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
use crate::retry::{RetryConfig, RetryHandler};

/// Generative-model provider.
pub const OPENAI: &str = "openai";
/// Page hosting / repository provider.
pub const GITHUB: &str = "github";
/// Ads platform API.
pub const GOOGLE_ADS: &str = "google_ads";

/// Lazily-populated breaker registry.
///
/// Owned by the application context rather than a process global, so tests can
/// build isolated registries. Breakers are never removed once created.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-populated with the breakers for the known dependencies.
    pub fn with_defaults() -> Self {
        let registry = Self::default();
        registry.register_known_dependencies();
        registry
    }

    /// Create the breakers for the known dependencies with their own
    /// thresholds. Existing breakers are left untouched.
    pub fn register_known_dependencies(&self) {
        self.get_or_create_with(OPENAI, CircuitBreakerConfig::new(3, Duration::from_secs(60)));
        self.get_or_create_with(GITHUB, CircuitBreakerConfig::new(5, Duration::from_secs(30)));
        self.get_or_create_with(
            GOOGLE_ADS,
            CircuitBreakerConfig::new(3, Duration::from_secs(45)),
        );
    }

    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }

    /// Get the breaker for `name`, creating it with the registry default config.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_config.clone())
    }

    /// Get the breaker for `name`, creating it with `config` if absent.
    ///
    /// The first creation wins: `config` is ignored for an existing breaker.
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return existing.clone();
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = name, "creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Registered breaker names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Status of every registered breaker keyed by name.
    pub fn all_stats(&self) -> BTreeMap<String, CircuitBreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        breakers
            .into_iter()
            .map(|b| (b.name().to_string(), b.status()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

/// Build a retry handler whose attempts go through the registry breaker `name`.
pub fn retry_with_breaker(
    registry: &CircuitBreakerRegistry,
    name: &str,
    config: RetryConfig,
) -> RetryHandler {
    RetryHandler::new(config).with_breaker(registry.get_or_create(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn same_name_returns_same_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_create("search");
        let b = registry.get_or_create("search");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn first_creation_config_wins() {
        let registry = CircuitBreakerRegistry::default();
        registry.get_or_create_with("hosting", CircuitBreakerConfig::new(7, Duration::from_secs(1)));
        let again =
            registry.get_or_create_with("hosting", CircuitBreakerConfig::new(1, Duration::from_secs(1)));
        assert_eq!(again.config().failure_threshold, 7);
    }

    #[test]
    fn defaults_register_known_dependencies() {
        let registry = CircuitBreakerRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["github", "google_ads", "openai"]);
        assert_eq!(registry.get(OPENAI).unwrap().config().failure_threshold, 3);
        assert_eq!(
            registry.get(GOOGLE_ADS).unwrap().config().timeout,
            Duration::from_secs(45)
        );
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn breakers_for_different_names_are_independent() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::new(1, Duration::from_secs(60)));
        let ads = registry.get_or_create("ads");
        let _ = ads.call(|| Err::<(), _>("down"));

        let stats = registry.all_stats();
        assert_eq!(stats["ads"].state, crate::CircuitState::Open);

        let hosting = registry.get_or_create("hosting");
        assert!(hosting.call(|| Ok::<_, String>(())).is_ok());
    }

    #[test]
    fn concurrent_creation_yields_one_instance() {
        let registry = Arc::new(CircuitBreakerRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.get_or_create("shared"))
            })
            .collect();

        let breakers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(breakers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn retry_handler_is_bound_to_named_breaker() {
        let registry = CircuitBreakerRegistry::with_defaults();
        let handler = retry_with_breaker(&registry, GITHUB, RetryConfig::default());
        let breaker = handler.breaker().unwrap();
        assert!(Arc::ptr_eq(breaker, &registry.get(GITHUB).unwrap()));
    }
}
