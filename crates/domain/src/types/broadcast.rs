//! Messages pushed to live dashboard subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::risk::BatchAssessment;

/// The payload variants a subscriber can receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BroadcastEvent {
    /// A batch finished risk analysis.
    Event(BatchAssessment),
    /// Operational notice.
    Status { message: String },
    /// Real-time distribution is suspended; core processing continues.
    Degraded { reason: String },
    /// Real-time distribution resumed.
    Recovered { message: String },
}

/// Envelope delivered to every subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(flatten)]
    pub event: BroadcastEvent,
    pub timestamp: DateTime<Utc>,
}

impl BroadcastMessage {
    /// Wrap a batch assessment.
    #[must_use]
    pub fn event(assessment: BatchAssessment) -> Self {
        Self { event: BroadcastEvent::Event(assessment), timestamp: Utc::now() }
    }

    /// Operational status notice.
    #[must_use]
    pub fn status(message: impl Into<String>) -> Self {
        Self { event: BroadcastEvent::Status { message: message.into() }, timestamp: Utc::now() }
    }

    /// Degraded-mode announcement.
    #[must_use]
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self { event: BroadcastEvent::Degraded { reason: reason.into() }, timestamp: Utc::now() }
    }

    /// Recovery announcement.
    #[must_use]
    pub fn recovered() -> Self {
        Self {
            event: BroadcastEvent::Recovered {
                message: "real-time distribution restored".to_string(),
            },
            timestamp: Utc::now(),
        }
    }
}
