//! Ingest jobs and detection-stage output types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical origin of work items (one camera); the unit of batching.
pub type SourceId = String;

/// Payload carried by an ingest job.
///
/// A tagged enum of known job shapes so consumers can handle every kind
/// exhaustively instead of probing an untyped blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// A captured camera frame, referenced by an opaque handle into frame
    /// storage.
    CameraFrame {
        /// Opaque reference resolvable by the detection service.
        frame_ref: String,
        /// When the camera captured the frame.
        captured_at: DateTime<Utc>,
    },
}

/// Unit of work submitted by producers to the ingest queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJob {
    pub source_id: SourceId,
    pub payload: JobPayload,
    pub enqueued_at: DateTime<Utc>,
}

impl IngestJob {
    /// Create a job stamped with the current time.
    #[must_use]
    pub fn new(source_id: impl Into<SourceId>, payload: JobPayload) -> Self {
        Self { source_id: source_id.into(), payload, enqueued_at: Utc::now() }
    }
}

/// Axis-aligned bounding box in normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One object found by the detection stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// Detected object class (e.g. `person`, `vehicle`).
    pub object_type: String,
    /// Detector confidence in `[0.0, 1.0]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// A persisted detection; the unit of batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// UUIDv7, so ids sort by creation time.
    pub id: String,
    pub source_id: SourceId,
    pub detection: Detection,
    pub detected_at: DateTime<Utc>,
}

impl DetectionRecord {
    /// Create a record with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(source_id: impl Into<SourceId>, detection: Detection) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            source_id: source_id.into(),
            detection,
            detected_at: Utc::now(),
        }
    }
}

/// Filter for querying persisted detections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionFilter {
    /// Restrict to one source.
    pub source_id: Option<SourceId>,
    /// Only detections at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Maximum rows returned.
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_record_ids_are_time_ordered() {
        let detection = Detection {
            object_type: "person".to_string(),
            confidence: 0.92,
            bbox: BoundingBox { x: 0.1, y: 0.2, width: 0.3, height: 0.4 },
        };
        let first = DetectionRecord::new("cam1", detection.clone());
        let second = DetectionRecord::new("cam1", detection);
        assert!(first.id < second.id, "UUIDv7 ids must sort by creation time");
    }

    #[test]
    fn job_payload_round_trips_with_kind_tag() {
        let job = IngestJob::new(
            "cam7",
            JobPayload::CameraFrame { frame_ref: "frames/0001".to_string(), captured_at: Utc::now() },
        );
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["payload"]["kind"], "camera_frame");

        let back: IngestJob = serde_json::from_value(json).unwrap();
        assert_eq!(back.source_id, "cam7");
    }
}
