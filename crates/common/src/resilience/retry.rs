//! Bounded exponential-backoff retry with failure classification.
//!
//! The executor runs an operation up to `max_retries + 1` times. Attempts are
//! 1-indexed and attempt 1 runs immediately; the delay before attempt `n + 1`
//! is `min(base_delay * exponential_base^(n-1), max_delay)`, optionally
//! stretched by up to 25% of itself with uniform jitter. A
//! [`FailureClassifier`] separates transient failures (worth retrying) from
//! fatal ones, which terminate on the first attempt without consuming any
//! retry budget. Exhaustion is a typed terminal outcome the caller branches
//! on; dead-lettering the job is the caller's move, not the executor's.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Likely to succeed on a later attempt (timeout, 5xx, connection
    /// refused).
    Transient,
    /// Will never succeed no matter how often it is retried (malformed
    /// input, rejected request).
    Fatal,
}

/// Classifies errors into [`FailureKind`]s for the executor.
pub trait FailureClassifier<E>: Send + Sync {
    /// Decide whether the error is transient or fatal.
    fn classify(&self, error: &E) -> FailureKind;
}

/// Terminal outcomes of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error.
    #[error("all {attempts} attempts exhausted")]
    Exhausted {
        /// Total attempts made, including the first.
        attempts: u32,
        /// The error from the final attempt.
        source: E,
    },
    /// The operation failed with an unretryable error on its first failure.
    #[error("unretryable failure")]
    Fatal {
        /// The fatal error.
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts consumed before this outcome.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Fatal { .. } => 1,
        }
    }

    /// Borrow the underlying error.
    #[must_use]
    pub fn source_error(&self) -> &E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Fatal { source } => source,
        }
    }

    /// Consume the outcome and return the underlying error.
    #[must_use]
    pub fn into_source(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Fatal { source } => source,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub exponential_base: f64,
    /// Add `uniform(0, 0.25) * delay` to each delay when enabled.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), super::circuit_breaker::ConfigError> {
        use super::circuit_breaker::ConfigError;
        if self.base_delay.is_zero() {
            return Err(ConfigError::Invalid {
                message: "base_delay must be greater than zero".to_string(),
            });
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::Invalid {
                message: "max_delay must be at least base_delay".to_string(),
            });
        }
        if self.exponential_base < 1.0 {
            return Err(ConfigError::Invalid {
                message: "exponential_base must be at least 1.0".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`RetryConfig`].
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: Option<RetryConfig>,
}

impl RetryConfigBuilder {
    fn config(&mut self) -> &mut RetryConfig {
        self.config.get_or_insert_with(RetryConfig::default)
    }

    /// Retries after the initial attempt.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config().max_retries = retries;
        self
    }

    /// Delay before the second attempt.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config().base_delay = delay;
        self
    }

    /// Upper bound on any single delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config().max_delay = delay;
        self
    }

    /// Multiplier applied per attempt.
    #[must_use]
    pub fn exponential_base(mut self, base: f64) -> Self {
        self.config().exponential_base = base;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.config().jitter = jitter;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(mut self) -> Result<RetryConfig, super::circuit_breaker::ConfigError> {
        let config = self.config().clone();
        config.validate()?;
        Ok(config)
    }
}

/// Delay preceding attempt `failed_attempt + 1`, without jitter.
///
/// `failed_attempt` is 1-indexed: after the first failed attempt the delay is
/// `base_delay`, doubling (for base 2.0) until capped at `max_delay`.
#[must_use]
pub fn backoff_delay(config: &RetryConfig, failed_attempt: u32) -> Duration {
    let exponent = failed_attempt.saturating_sub(1);
    let millis = config.base_delay.as_millis() as f64
        * config.exponential_base.powi(exponent as i32);
    let capped = millis.min(config.max_delay.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

fn jittered(config: &RetryConfig, delay: Duration) -> Duration {
    if !config.jitter || delay.is_zero() {
        return delay;
    }
    let extra = delay.mul_f64(rand::thread_rng().gen_range(0.0..0.25));
    delay + extra
}

/// Retry executor combining backoff, jitter, and failure classification.
pub struct RetryExecutor<C> {
    config: RetryConfig,
    classifier: C,
}

impl<C> RetryExecutor<C> {
    /// Create an executor from a validated configuration and a classifier.
    pub fn new(config: RetryConfig, classifier: C) -> Self {
        Self { config, classifier }
    }

    /// The configuration this executor runs with.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic.
    ///
    /// Returns the first success, a [`RetryError::Fatal`] as soon as the
    /// classifier rules an error unretryable, or [`RetryError::Exhausted`]
    /// carrying the final error once `max_retries + 1` attempts have failed.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        C: FailureClassifier<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let total_attempts = self.config.max_retries + 1;
        let mut attempt = 1u32;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if self.classifier.classify(&error) == FailureKind::Fatal {
                        warn!(error = ?error, "unretryable failure, not consuming retry budget");
                        return Err(RetryError::Fatal { source: error });
                    }
                    if attempt >= total_attempts {
                        warn!(
                            attempts = attempt,
                            error = ?error,
                            "retry budget exhausted"
                        );
                        return Err(RetryError::Exhausted { attempts: attempt, source: error });
                    }
                    let delay = jittered(&self.config, backoff_delay(&self.config, attempt));
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = ?error,
                        "transient failure, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Pre-defined classifiers for common scenarios.
pub mod classifiers {
    use super::*;

    /// Treats every error as transient.
    #[derive(Debug, Clone, Copy)]
    pub struct AlwaysTransient;

    impl<E> FailureClassifier<E> for AlwaysTransient {
        fn classify(&self, _error: &E) -> FailureKind {
            FailureKind::Transient
        }
    }

    /// Treats every error as fatal, so the operation runs exactly once.
    #[derive(Debug, Clone, Copy)]
    pub struct AlwaysFatal;

    impl<E> FailureClassifier<E> for AlwaysFatal {
        fn classify(&self, _error: &E) -> FailureKind {
            FailureKind::Fatal
        }
    }

    /// Classifies with a predicate returning `true` for transient errors.
    #[derive(Debug)]
    pub struct Predicate<F> {
        predicate: F,
    }

    impl<F> Predicate<F> {
        /// Wrap a predicate; `true` means transient.
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> FailureClassifier<E> for Predicate<F>
    where
        F: Fn(&E) -> bool + Send + Sync,
    {
        fn classify(&self, error: &E) -> FailureKind {
            if (self.predicate)(error) {
                FailureKind::Transient
            } else {
                FailureKind::Fatal
            }
        }
    }
}
