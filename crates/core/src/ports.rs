//! Port interfaces for the pipeline's external collaborators.

use std::time::Duration;

use async_trait::async_trait;
use sentinel_domain::{
    BatchAssessment, BroadcastMessage, DeadLetterRecord, Detection, DetectionBatch,
    DetectionFilter, DetectionRecord, JobPayload, OpenBatchSnapshot, QueueName, Result,
    RiskAssessment,
};

/// Object-detection inference service.
#[async_trait]
pub trait DetectionClient: Send + Sync {
    /// Run detection on a payload, returning zero or more detections.
    async fn detect(&self, payload: &JobPayload) -> Result<Vec<Detection>>;
}

/// Risk-analysis inference service (LLM).
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    /// Score one closed batch.
    async fn assess(&self, batch: &DetectionBatch) -> Result<RiskAssessment>;
}

/// Append-only persistence for detections and assessments.
///
/// The pipeline never reads back its own writes synchronously on the hot
/// path; queries serve operators and dashboards.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one detection record.
    async fn store_detection(&self, record: &DetectionRecord) -> Result<()>;

    /// Append one batch assessment.
    async fn store_assessment(&self, assessment: &BatchAssessment) -> Result<()>;

    /// Query persisted detections.
    async fn query_detections(&self, filter: &DetectionFilter) -> Result<Vec<DetectionRecord>>;
}

/// Key-value store with per-entry expiry, mirroring open batch state for
/// crash recovery and visibility.
///
/// The aggregator's correctness never depends on this store providing
/// transactions; the in-process per-source lock is the concurrency
/// primitive.
#[async_trait]
pub trait BatchStateStore: Send + Sync {
    /// Upsert the snapshot for a source with the given expiry.
    async fn put(&self, snapshot: &OpenBatchSnapshot, ttl: Duration) -> Result<()>;

    /// Fetch the snapshot for a source, if present and unexpired.
    async fn get(&self, source_id: &str) -> Result<Option<OpenBatchSnapshot>>;

    /// Remove the snapshot for a source.
    async fn remove(&self, source_id: &str) -> Result<()>;

    /// List all live snapshots (used for orphan recovery at startup).
    async fn scan(&self) -> Result<Vec<OpenBatchSnapshot>>;
}

/// Storage for dead-letter records.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert a record.
    async fn insert(&self, record: DeadLetterRecord) -> Result<()>;

    /// All records, most recently failed first.
    async fn list(&self) -> Result<Vec<DeadLetterRecord>>;

    /// Fetch one record by id.
    async fn get(&self, record_id: &str) -> Result<Option<DeadLetterRecord>>;

    /// Remove and return one record by id.
    async fn remove(&self, record_id: &str) -> Result<Option<DeadLetterRecord>>;

    /// Delete every record originating from the given queue; returns how
    /// many were deleted.
    async fn clear(&self, queue: QueueName) -> Result<usize>;

    /// Number of records originating from the given queue.
    async fn count(&self, queue: QueueName) -> Result<usize>;
}

/// The internal distribution backend the broadcaster listens on.
#[async_trait]
pub trait DistributionChannel: Send + Sync {
    /// Publish a message to the channel.
    async fn publish(&self, message: &BroadcastMessage) -> Result<()>;

    /// Open a subscription. Each call yields an independent stream.
    async fn subscribe(&self) -> Result<Box<dyn DistributionStream>>;
}

/// A live subscription to the distribution channel.
#[async_trait]
pub trait DistributionStream: Send {
    /// Next message; `Ok(None)` means the channel closed cleanly.
    async fn next(&mut self) -> Result<Option<BroadcastMessage>>;
}
