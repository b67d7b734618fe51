//! Batch types emitted by the aggregator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{DetectionRecord, SourceId};

/// A closed batch of detections for one source, pushed onto the analysis
/// queue as a single unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionBatch {
    /// UUIDv7.
    pub batch_id: String,
    pub source_id: SourceId,
    /// Detection record ids in arrival order.
    pub member_ids: Vec<String>,
    /// When the first member arrived.
    pub started_at: DateTime<Utc>,
    /// When the batch was closed.
    pub ended_at: DateTime<Utc>,
}

impl DetectionBatch {
    /// Build a singleton batch for a fast-path detection, bypassing
    /// aggregation.
    #[must_use]
    pub fn singleton(record: &DetectionRecord) -> Self {
        let now = Utc::now();
        Self {
            batch_id: Uuid::now_v7().to_string(),
            source_id: record.source_id.clone(),
            member_ids: vec![record.id.clone()],
            started_at: record.detected_at,
            ended_at: now,
        }
    }

    /// Number of member detections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.member_ids.len()
    }

    /// True when the batch has no members. Closed batches always have at
    /// least one member; this exists for completeness.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
    }
}

/// Serializable snapshot of an open batch, mirrored into the external
/// key-value store with a TTL strictly greater than the window duration.
///
/// The snapshot is a crash-recovery and visibility mechanism only; the
/// aggregator's in-process per-source lock is the concurrency primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenBatchSnapshot {
    pub batch_id: String,
    pub source_id: SourceId,
    pub member_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl OpenBatchSnapshot {
    /// Convert an orphaned snapshot into a batch emission so accumulated
    /// members are never dropped by expiry alone.
    #[must_use]
    pub fn into_batch(self) -> DetectionBatch {
        DetectionBatch {
            batch_id: self.batch_id,
            source_id: self.source_id,
            member_ids: self.member_ids,
            started_at: self.started_at,
            ended_at: self.last_activity_at,
        }
    }
}
