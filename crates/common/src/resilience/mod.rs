//! Resilience patterns guarding every external dependency of the pipeline.
//!
//! This module provides **generic, reusable** implementations of:
//! - **Circuit Breaker**: detects repeated failures against one dependency
//!   and fast-fails callers until the dependency recovers
//! - **Retry**: bounded exponential backoff with jitter and a transient/fatal
//!   failure classification, so unretryable work is never retried
//! - **Registry**: an explicit name → breaker mapping constructed once at
//!   startup and passed by handle, instead of ambient singletons
//!
//! The breaker and the retry executor compose: callers retry transient
//! failures while recording each attempt on the shared breaker, and stop
//! consuming retry budget as soon as the breaker opens.

pub mod circuit_breaker;
pub mod registry;
pub mod retry;

// Re-export circuit breaker types
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerSnapshot,
    CircuitError, CircuitState, Clock, ConfigError, MockClock, SystemClock,
};
pub use registry::CircuitBreakerRegistry;
// Re-export retry types
pub use retry::{
    backoff_delay, classifiers, FailureClassifier, FailureKind, RetryConfig, RetryConfigBuilder,
    RetryError, RetryExecutor,
};
