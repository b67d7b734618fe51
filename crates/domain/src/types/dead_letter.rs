//! Dead-letter records for jobs awaiting manual operator intervention.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::batch::DetectionBatch;
use super::job::IngestJob;

/// The pipeline queues a job can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Queue A: producer-submitted ingest jobs awaiting detection.
    Ingest,
    /// Queue B: closed batches awaiting risk analysis.
    Analysis,
}

impl QueueName {
    /// Stable string form used in logs and the health surface.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Ingest => "ingest",
            QueueName::Analysis => "analysis",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The job a dead-letter record preserves, tagged by origin stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum DeadLetterJob {
    Ingest(IngestJob),
    Analysis(DetectionBatch),
}

impl DeadLetterJob {
    /// The queue this job came from (and returns to on requeue).
    #[must_use]
    pub fn source_queue(&self) -> QueueName {
        match self {
            DeadLetterJob::Ingest(_) => QueueName::Ingest,
            DeadLetterJob::Analysis(_) => QueueName::Analysis,
        }
    }
}

/// A job moved aside after exhausting retries (or failing fatally), awaiting
/// manual requeue or discard. Read-only outside the DLQ management
/// interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// UUIDv7.
    pub record_id: String,
    pub job: DeadLetterJob,
    pub error_message: String,
    /// Attempts consumed before dead-lettering; zero when the job was
    /// evicted or gated off without ever being attempted.
    pub attempt_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub source_queue: QueueName,
}

impl DeadLetterRecord {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(job: DeadLetterJob, error_message: impl Into<String>, attempt_count: u32) -> Self {
        let now = Utc::now();
        let source_queue = job.source_queue();
        Self {
            record_id: Uuid::now_v7().to_string(),
            job,
            error_message: error_message.into(),
            attempt_count,
            first_failed_at: now,
            last_failed_at: now,
            source_queue,
        }
    }
}
