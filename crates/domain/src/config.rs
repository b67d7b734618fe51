//! Pipeline configuration structures.
//!
//! Every section has working defaults and a `validate()` that rejects
//! configurations the pipeline cannot run safely with (most importantly a
//! batch-state TTL that is not strictly greater than the window cap).
//! Durations serialize as integer milliseconds so an embedding application
//! can supply configuration as JSON or TOML.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SentinelError};

/// Serde helpers for `Duration` as integer milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a duration as milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    /// Deserialize a duration from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Overflow behavior selection, mapped onto the queue primitive by the
/// runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOverflow {
    /// Refuse new items when full; producers see the rejection.
    Reject,
    /// Evict the oldest items into the dead-letter store to admit new ones.
    DeadLetter,
    /// Legacy: discard the oldest items without preservation.
    DropOldest,
}

/// Capacities and overflow behavior for the two pipeline queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub ingest_capacity: usize,
    pub analysis_capacity: usize,
    pub overflow: QueueOverflow,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { ingest_capacity: 512, analysis_capacity: 128, overflow: QueueOverflow::DeadLetter }
    }
}

/// Predicate configuration for the aggregation bypass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastPathConfig {
    /// Minimum confidence for a detection to qualify.
    pub min_confidence: f32,
    /// Object classes that qualify for immediate dispatch.
    pub critical_types: Vec<String>,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.9,
            critical_types: vec!["weapon".to_string(), "fire".to_string()],
        }
    }
}

/// Batch aggregation windows and sweep cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Hard upper bound on how long a batch stays open from its first
    /// member.
    #[serde(with = "duration_millis")]
    pub window_duration: Duration,
    /// Inactivity period after which an open batch closes early.
    #[serde(with = "duration_millis")]
    pub idle_duration: Duration,
    /// Cadence of the closure sweep.
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,
    /// Expiry on mirrored open-batch snapshots. Must be strictly greater
    /// than `window_duration` so a live batch is never evicted from under
    /// the aggregator.
    #[serde(with = "duration_millis")]
    pub state_ttl: Duration,
    pub fast_path: FastPathConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_duration: Duration::from_secs(90),
            idle_duration: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            state_ttl: Duration::from_secs(180),
            fast_path: FastPathConfig::default(),
        }
    }
}

/// Retry behavior for one dependency, mapped onto the retry executor by the
/// runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
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

/// Circuit breaker thresholds for one dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 2,
        }
    }
}

/// Broadcaster buffering, reconnect, and supervision cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Per-subscriber channel depth; a subscriber that falls this far behind
    /// is disconnected rather than blocking fan-out.
    pub subscriber_buffer: usize,
    /// Failed subscription attempts before entering degraded mode.
    pub reconnect_max_attempts: u32,
    /// Pause between subscription attempts.
    #[serde(with = "duration_millis")]
    pub reconnect_delay: Duration,
    /// Cadence of the supervision task.
    #[serde(with = "duration_millis")]
    pub supervise_interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
            reconnect_max_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            supervise_interval: Duration::from_secs(5),
        }
    }
}

/// Worker pool sizes and lifecycle timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub detection_workers: usize,
    pub analysis_workers: usize,
    /// How long a worker parks on an empty queue before re-checking for
    /// shutdown.
    #[serde(with = "duration_millis")]
    pub dequeue_timeout: Duration,
    /// How long `stop()` waits for each task to finish.
    #[serde(with = "duration_millis")]
    pub join_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            detection_workers: 4,
            analysis_workers: 2,
            dequeue_timeout: Duration::from_millis(250),
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queues: QueueConfig,
    pub aggregator: AggregatorConfig,
    pub detection_retry: RetrySettings,
    pub analysis_retry: RetrySettings,
    pub detection_breaker: BreakerSettings,
    pub analysis_breaker: BreakerSettings,
    pub distribution_breaker: BreakerSettings,
    pub broadcast: BroadcastConfig,
    pub workers: WorkerConfig,
}

impl PipelineConfig {
    /// Validate cross-field invariants the pipeline depends on.
    pub fn validate(&self) -> Result<()> {
        if self.queues.ingest_capacity == 0 || self.queues.analysis_capacity == 0 {
            return Err(SentinelError::Config("queue capacities must be non-zero".into()));
        }
        if self.aggregator.state_ttl <= self.aggregator.window_duration {
            return Err(SentinelError::Config(
                "aggregator state_ttl must be strictly greater than window_duration".into(),
            ));
        }
        if self.aggregator.idle_duration > self.aggregator.window_duration {
            return Err(SentinelError::Config(
                "aggregator idle_duration must not exceed window_duration".into(),
            ));
        }
        if self.aggregator.sweep_interval.is_zero() {
            return Err(SentinelError::Config("aggregator sweep_interval must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.aggregator.fast_path.min_confidence) {
            return Err(SentinelError::Config(
                "fast-path min_confidence must be within [0.0, 1.0]".into(),
            ));
        }
        if self.workers.detection_workers == 0 || self.workers.analysis_workers == 0 {
            return Err(SentinelError::Config("worker counts must be non-zero".into()));
        }
        if self.broadcast.subscriber_buffer == 0 {
            return Err(SentinelError::Config("subscriber_buffer must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        PipelineConfig::default().validate().expect("defaults must validate");
    }

    #[test]
    fn state_ttl_must_exceed_window() {
        let mut config = PipelineConfig::default();
        config.aggregator.state_ttl = config.aggregator.window_duration;
        assert!(config.validate().is_err());

        config.aggregator.state_ttl =
            config.aggregator.window_duration + Duration::from_millis(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = PipelineConfig::default();
        config.workers.analysis_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn durations_round_trip_as_millis() {
        let config = PipelineConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["aggregator"]["window_duration"], 90_000);
        assert_eq!(json["aggregator"]["idle_duration"], 30_000);

        let back: PipelineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.aggregator.window_duration, Duration::from_secs(90));
        back.validate().unwrap();
    }

    #[test]
    fn partial_config_fills_defaults() {
        let json = serde_json::json!({
            "queues": { "ingest_capacity": 64, "analysis_capacity": 16, "overflow": "reject" }
        });
        let config: PipelineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.queues.ingest_capacity, 64);
        assert_eq!(config.queues.overflow, QueueOverflow::Reject);
        assert_eq!(config.workers.detection_workers, 4);
    }
}
