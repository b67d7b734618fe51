//! Generic infrastructure primitives shared across Sentinel crates.
//!
//! This crate holds the domain-free building blocks of the pipeline:
//! bounded work queues with overflow policies and the resilience patterns
//! (circuit breaker, retry with backoff) that guard every external
//! dependency. Nothing in here knows about cameras, detections, or risk
//! scores: the types are generic and the policies are injected.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod collections;
pub mod resilience;

// Re-export commonly used types for convenience
// ------------------------
pub use collections::{
    BoundedQueue, BoundedQueueBuilder, EnqueueError, EnqueueOutcome, OverflowPolicy, OverflowSink,
    QueueMetrics, PRESSURE_WARN_RATIO,
};
pub use resilience::{
    backoff_delay, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitError, CircuitState, Clock,
    FailureClassifier, FailureKind, MockClock, RetryConfig, RetryConfigBuilder, RetryError,
    RetryExecutor, SystemClock,
};
