//! Named circuit breaker registry.
//!
//! # Responsibilities
//! - Map resource names to shared breaker instances
//! - Create breakers lazily, exactly once per name
//! - Expose status snapshots for health/metrics consumers

use std::sync::Arc;

use dashmap::DashMap;

use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};

/// Owned registry of breakers keyed by resource name.
///
/// Callers hold their own `Arc<CircuitBreaker>`, so [`clear`](Self::clear)
/// never invalidates a breaker that is in use; later lookups simply get a
/// fresh instance.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_defaults(CircuitBreakerConfig::default())
    }

    /// Registry whose lazily created breakers start from `defaults`.
    pub fn with_defaults(defaults: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
        }
    }

    /// Return the breaker for `name`, creating it on first access.
    ///
    /// `config` is only used when the breaker does not exist yet; its `name`
    /// field is overwritten with `name`.
    pub fn get_or_create(&self, name: &str, config: Option<CircuitBreakerConfig>) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }

        // The entry guard holds the shard lock, so concurrent first access
        // still produces a single instance.
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let mut config = config.unwrap_or_else(|| self.defaults.clone());
                config.name = name.to_string();
                tracing::debug!(
                    breaker = name,
                    failure_threshold = config.failure_threshold,
                    recovery_timeout = ?config.recovery_timeout,
                    "Circuit breaker created"
                );
                Arc::new(CircuitBreaker::new(config))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|r| r.value().clone())
    }

    /// Status of every registered breaker, sorted by name.
    pub fn statuses(&self) -> Vec<CircuitBreakerStatus> {
        let mut statuses: Vec<_> = self.breakers.iter().map(|r| r.value().get_status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Drop every registered breaker.
    pub fn clear(&self) {
        let count = self.breakers.len();
        self.breakers.clear();
        tracing::info!(cleared = count, "Circuit breaker registry cleared");
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
