//! Domain model types.

pub mod batch;
pub mod broadcast;
pub mod dead_letter;
pub mod health;
pub mod job;
pub mod risk;

pub use batch::{DetectionBatch, OpenBatchSnapshot};
pub use broadcast::{BroadcastEvent, BroadcastMessage};
pub use dead_letter::{DeadLetterJob, DeadLetterRecord, QueueName};
pub use health::{BreakerHealth, HealthSnapshot, QueueHealth};
pub use job::{
    BoundingBox, Detection, DetectionFilter, DetectionRecord, IngestJob, JobPayload, SourceId,
};
pub use risk::{BatchAssessment, RiskAssessment, RiskLevel};
