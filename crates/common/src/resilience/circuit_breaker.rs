//! Circuit breaker: a per-dependency failure gate.
//!
//! The breaker walks an explicit CLOSED → OPEN → HALF_OPEN state machine.
//! All state lives behind a single mutex so concurrent callers can never
//! interleave a read-modify-write and leak calls through an open circuit.
//! Deadlines are checked against a monotonic [`Clock`], which tests replace
//! with [`MockClock`] to drive timeout behavior without real delays.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

//==============================================================================
// Time Abstraction for Testability
//==============================================================================

/// Trait for monotonic time, so deadline logic can be tested
/// deterministically.
pub trait Clock: Send + Sync + 'static {
    /// Get the current instant (monotonic time).
    fn now(&self) -> Instant;
}

/// Real system clock implementation for production use.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<T: Clock> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Mock clock for deterministic testing.
///
/// Tests advance it explicitly instead of sleeping.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self { start: Instant::now(), elapsed: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    /// Advance the mock clock by a duration.
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }

    /// Get the elapsed time since construction.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock()
    }
}

//==============================================================================
// Configuration
//==============================================================================

/// Simple configuration error for validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed validation.
    #[error("Invalid configuration: {message}")]
    Invalid {
        /// Human-readable description of the rejected field.
        message: String,
    },
}

/// Configuration for circuit breaker behavior, tunable per dependency.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Consecutive probe successes needed to close from half-open.
    pub success_threshold: u32,
    /// Time to wait in open before permitting probes.
    pub recovery_timeout: Duration,
    /// Maximum number of concurrent probe calls in half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "failure_threshold must be greater than 0".to_string(),
            });
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "success_threshold must be greater than 0".to_string(),
            });
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::Invalid {
                message: "half_open_max_calls must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: Option<CircuitBreakerConfig>,
}

impl CircuitBreakerConfigBuilder {
    fn config(&mut self) -> &mut CircuitBreakerConfig {
        self.config.get_or_insert_with(CircuitBreakerConfig::default)
    }

    /// Consecutive failures before opening the circuit.
    #[must_use]
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config().failure_threshold = threshold;
        self
    }

    /// Consecutive probe successes needed to close from half-open.
    #[must_use]
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config().success_threshold = threshold;
        self
    }

    /// Time to wait in open before permitting probes.
    #[must_use]
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config().recovery_timeout = timeout;
        self
    }

    /// Maximum number of concurrent probe calls in half-open.
    #[must_use]
    pub fn half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.config().half_open_max_calls = max_calls;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(mut self) -> Result<CircuitBreakerConfig, ConfigError> {
        let config = self.config().clone();
        config.validate()?;
        Ok(config)
    }
}

//==============================================================================
// State machine
//==============================================================================

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing calls.
    Closed,
    /// Circuit is open, rejecting calls.
    Open,
    /// Circuit is half-open, permitting a limited number of probes.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Error produced by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum CircuitError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The circuit is open; the operation was never attempted.
    #[error("circuit breaker is open, rejecting calls")]
    Open,
    /// The underlying operation failed.
    #[error("operation failed")]
    Operation {
        /// The failure reported by the operation.
        #[source]
        source: E,
    },
}

/// Point-in-time view of one breaker for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    /// Current state of the breaker.
    pub state: CircuitState,
    /// Failures recorded since the last success or transition.
    pub consecutive_failures: u32,
    /// Probe successes recorded since entering half-open.
    pub consecutive_successes: u32,
    /// Calls rejected while open or probe-saturated.
    pub rejected_calls: u64,
    /// Total calls permitted through the breaker.
    pub total_calls: u64,
    /// Time since the last state transition.
    pub since_last_transition: Duration,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    last_transition_at: Instant,
    rejected_calls: u64,
    total_calls: u64,
}

/// Per-dependency failure gate shared by all concurrent callers.
///
/// The contract is `is_call_permitted()` followed by exactly one
/// `record_success()` or `record_failure()` for every permitted call; the
/// [`CircuitBreaker::execute`] helper enforces the pairing. A permitted call
/// in half-open occupies one of the limited probe slots until its outcome is
/// recorded.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &snapshot.state)
            .field("consecutive_failures", &snapshot.consecutive_failures)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration and the system clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a breaker with a custom clock (used by tests).
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_in_flight: 0,
                opened_at: None,
                last_failure_at: None,
                last_transition_at: now,
                rejected_calls: 0,
                total_calls: 0,
            }),
            clock,
        })
    }

    /// Create a breaker with default configuration.
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default()).expect("default config is valid")
    }

    /// Breaker name as given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking check whether a call may proceed.
    ///
    /// Transitions open → half-open when the recovery timeout has elapsed.
    /// In half-open a `true` result occupies a probe slot that is released by
    /// `record_success()` / `record_failure()`.
    pub fn is_call_permitted(&self) -> bool {
        let now = self.clock.now();
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => {
                s.total_calls += 1;
                true
            }
            CircuitState::Open => {
                let recovered = s
                    .opened_at
                    .is_some_and(|at| now.duration_since(at) >= self.config.recovery_timeout);
                if recovered {
                    s.state = CircuitState::HalfOpen;
                    s.consecutive_successes = 0;
                    s.half_open_in_flight = 1;
                    s.last_transition_at = now;
                    s.total_calls += 1;
                    debug!(breaker = %self.name, "circuit half-open, permitting probe");
                    true
                } else {
                    s.rejected_calls += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                if s.half_open_in_flight < self.config.half_open_max_calls {
                    s.half_open_in_flight += 1;
                    s.total_calls += 1;
                    true
                } else {
                    s.rejected_calls += 1;
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => {
                s.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
                s.consecutive_successes += 1;
                if s.consecutive_successes >= self.config.success_threshold {
                    s.state = CircuitState::Closed;
                    s.consecutive_failures = 0;
                    s.consecutive_successes = 0;
                    s.half_open_in_flight = 0;
                    s.opened_at = None;
                    s.last_transition_at = now;
                    info!(breaker = %self.name, "circuit closed after successful probes");
                }
            }
            CircuitState::Open => {
                warn!(breaker = %self.name, "success recorded while circuit is open");
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut s = self.state.lock();
        s.last_failure_at = Some(now);
        match s.state {
            CircuitState::Closed => {
                s.consecutive_failures += 1;
                s.consecutive_successes = 0;
                if s.consecutive_failures >= self.config.failure_threshold {
                    s.state = CircuitState::Open;
                    s.opened_at = Some(now);
                    s.last_transition_at = now;
                    warn!(
                        breaker = %self.name,
                        failures = s.consecutive_failures,
                        "circuit opened after repeated failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Any probe failure immediately reopens the circuit.
                s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
                s.state = CircuitState::Open;
                s.opened_at = Some(now);
                s.consecutive_successes = 0;
                s.last_transition_at = now;
                warn!(breaker = %self.name, "circuit reopened after probe failure");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state of the breaker (no transition side effects).
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Snapshot the breaker for monitoring.
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = self.clock.now();
        let s = self.state.lock();
        CircuitBreakerSnapshot {
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            consecutive_successes: s.consecutive_successes,
            rejected_calls: s.rejected_calls,
            total_calls: s.total_calls,
            since_last_transition: now.duration_since(s.last_transition_at),
        }
    }

    /// Manually reset the breaker to closed with clean counters.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut s = self.state.lock();
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.consecutive_successes = 0;
        s.half_open_in_flight = 0;
        s.opened_at = None;
        s.last_transition_at = now;
        info!(breaker = %self.name, "circuit manually reset to closed");
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// Pairs the permission check with outcome recording so callers cannot
    /// forget to release a probe slot.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if !self.is_call_permitted() {
            debug!(breaker = %self.name, "circuit breaker rejecting call");
            return Err(CircuitError::Open);
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(CircuitError::Operation { source: error })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the circuit breaker state machine.
    //!
    //! Timeout transitions are driven by `MockClock` so no test sleeps.

    use super::*;

    fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new());
        let cb = CircuitBreaker::with_clock("test", config, clock.clone()).unwrap();
        (cb, clock)
    }

    #[test]
    fn config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.recovery_timeout, Duration::from_secs(30));
        assert_eq!(config.half_open_max_calls, 2);
    }

    #[test]
    fn config_validation_rejects_zeroes() {
        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().success_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().half_open_max_calls(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().build().is_ok());
    }

    #[test]
    fn state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }

    /// Exactly `failure_threshold` consecutive failures trip the circuit.
    #[test]
    fn opens_at_exact_failure_threshold() {
        let config = CircuitBreakerConfig::builder().failure_threshold(3).build().unwrap();
        let (cb, _clock) = breaker(config);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_call_permitted());
    }

    /// Threshold minus one failures followed by a success resets the counter
    /// without tripping.
    #[test]
    fn success_resets_failure_count() {
        let config = CircuitBreakerConfig::builder().failure_threshold(3).build().unwrap();
        let (cb, _clock) = breaker(config);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.snapshot().consecutive_failures, 0);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    /// After the recovery timeout the next call is permitted as a probe.
    #[test]
    fn recovery_timeout_permits_probe() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .recovery_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        let (cb, clock) = breaker(config);

        cb.record_failure();
        assert!(!cb.is_call_permitted());

        clock.advance(Duration::from_secs(29));
        assert!(!cb.is_call_permitted());

        clock.advance(Duration::from_secs(1));
        assert!(cb.is_call_permitted());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    /// A probe failure returns the circuit to open with a fresh deadline.
    #[test]
    fn probe_failure_reopens() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .recovery_timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        let (cb, clock) = breaker(config);

        cb.record_failure();
        clock.advance(Duration::from_secs(10));
        assert!(cb.is_call_permitted());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // The reopen resets opened_at, so recovery requires the full timeout
        // again.
        clock.advance(Duration::from_secs(9));
        assert!(!cb.is_call_permitted());
        clock.advance(Duration::from_secs(1));
        assert!(cb.is_call_permitted());
    }

    /// `success_threshold` consecutive probe successes close the circuit.
    #[test]
    fn probe_successes_close_circuit() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .success_threshold(2)
            .half_open_max_calls(2)
            .recovery_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let (cb, clock) = breaker(config);

        cb.record_failure();
        clock.advance(Duration::from_secs(5));

        assert!(cb.is_call_permitted());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.is_call_permitted());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    /// Half-open limits the number of concurrent probes.
    #[test]
    fn half_open_caps_concurrent_probes() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .half_open_max_calls(2)
            .recovery_timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        let (cb, clock) = breaker(config);

        cb.record_failure();
        clock.advance(Duration::from_secs(1));

        assert!(cb.is_call_permitted());
        assert!(cb.is_call_permitted());
        assert!(!cb.is_call_permitted(), "third concurrent probe must be rejected");

        // Releasing a slot re-admits a probe.
        cb.record_success();
        assert!(cb.is_call_permitted());
    }

    #[test]
    fn snapshot_counts_rejections() {
        let config = CircuitBreakerConfig::builder().failure_threshold(1).build().unwrap();
        let (cb, _clock) = breaker(config);

        cb.record_failure();
        assert!(!cb.is_call_permitted());
        assert!(!cb.is_call_permitted());

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.rejected_calls, 2);
    }

    #[test]
    fn reset_restores_closed_state() {
        let config = CircuitBreakerConfig::builder().failure_threshold(1).build().unwrap();
        let (cb, _clock) = breaker(config);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn execute_records_outcomes() {
        let cb = CircuitBreaker::with_defaults("exec");

        let result = cb.execute(|| async { Ok::<_, std::io::Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);

        let result = cb.execute(|| async { Err::<(), _>(std::io::Error::other("boom")) }).await;
        assert!(matches!(result, Err(CircuitError::Operation { .. })));
        assert_eq!(cb.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn execute_rejects_when_open() {
        let config = CircuitBreakerConfig::builder().failure_threshold(1).build().unwrap();
        let cb = CircuitBreaker::new("exec-open", config).unwrap();

        cb.record_failure();

        let result = cb.execute(|| async { Ok::<_, std::io::Error>(1) }).await;
        assert!(matches!(result, Err(CircuitError::Open)));
    }

    /// Concurrent callers sharing one breaker never corrupt the counters.
    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_recording_is_consistent() {
        let config =
            CircuitBreakerConfig::builder().failure_threshold(100_000).build().unwrap();
        let cb = Arc::new(CircuitBreaker::new("concurrent", config).unwrap());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cb = Arc::clone(&cb);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    cb.record_failure();
                    cb.record_success();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // Every failure was followed by a success, so the count is settled.
        assert_eq!(cb.snapshot().consecutive_failures, 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
