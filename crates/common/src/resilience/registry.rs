//! Explicit registry mapping dependency names to circuit breakers.
//!
//! Constructed once at process start and passed by handle to every caller
//! that needs a breaker; there is deliberately no module-level singleton.

use std::sync::Arc;

use dashmap::DashMap;

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, ConfigError,
};

/// Owns one [`CircuitBreaker`] per named dependency.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker for a dependency, replacing any existing one.
    pub fn register(
        &self,
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>, ConfigError> {
        let name = name.into();
        let breaker = Arc::new(CircuitBreaker::new(name.clone(), config)?);
        self.breakers.insert(name, Arc::clone(&breaker));
        Ok(breaker)
    }

    /// Look up the breaker for a dependency.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered breakers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// True when no breakers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshot every breaker for the health surface.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<(String, CircuitBreakerSnapshot)> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        snapshots.sort_by(|a, b| a.0.cmp(&b.0));
        snapshots
    }
}
