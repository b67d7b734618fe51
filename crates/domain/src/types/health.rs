//! Health surface types for operators.
//!
//! The snapshot lets an operator distinguish "pipeline healthy, just slow"
//! from "real-time updates stale (degraded)" from "dependency failing, items
//! piling into the DLQ".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One queue's view in the health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    pub name: String,
    pub len: usize,
    pub capacity: usize,
    pub fill_ratio: f64,
    /// True when the fill ratio crossed the alerting threshold (0.8).
    pub under_pressure: bool,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
}

/// One circuit breaker's view in the health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerHealth {
    pub dependency: String,
    /// `CLOSED`, `OPEN`, or `HALF_OPEN`.
    pub state: String,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub rejected_calls: u64,
}

/// Point-in-time health of the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub queues: Vec<QueueHealth>,
    /// Dead-letter record counts per origin queue.
    pub dead_letters: Vec<(String, usize)>,
    pub breakers: Vec<BreakerHealth>,
    /// True while real-time distribution is suspended.
    pub broadcast_degraded: bool,
    pub generated_at: DateTime<Utc>,
}
