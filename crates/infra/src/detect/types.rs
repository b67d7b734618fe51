//! Wire types for the detection service API.

use chrono::{DateTime, Utc};
use sentinel_domain::Detection;
use serde::{Deserialize, Serialize};

/// Request body for a detection call.
#[derive(Debug, Serialize)]
pub struct DetectRequest {
    pub frame_ref: String,
    pub captured_at: DateTime<Utc>,
}

/// Response body from the detection service.
#[derive(Debug, Deserialize)]
pub struct DetectResponse {
    pub detections: Vec<Detection>,
}
