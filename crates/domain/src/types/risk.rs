//! Risk assessment types produced by the analysis stage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::batch::DetectionBatch;
use super::job::SourceId;

/// Coarse risk bucket reported to dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

/// Analysis-stage output for one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Score in `[0, 100]`.
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub summary: String,
    pub reasoning: String,
}

impl RiskAssessment {
    /// The documented stand-in used when the analysis dependency is
    /// persistently unavailable: the batch is never dropped, it ships with a
    /// neutral score instead.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            risk_score: 50,
            risk_level: RiskLevel::Medium,
            summary: "risk analysis unavailable; neutral score assigned".to_string(),
            reasoning: "analysis dependency was unreachable when this batch was processed"
                .to_string(),
        }
    }
}

/// A batch joined with its assessment; the unit of persistence and
/// broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAssessment {
    pub batch_id: String,
    pub source_id: SourceId,
    /// Number of detections the batch carried.
    pub member_count: usize,
    pub assessment: RiskAssessment,
    pub assessed_at: DateTime<Utc>,
    /// True when the assessment is the unavailability fallback rather than a
    /// real analysis result.
    pub degraded_fallback: bool,
}

impl BatchAssessment {
    /// Join a batch with its assessment, stamped with the current time.
    #[must_use]
    pub fn new(batch: &DetectionBatch, assessment: RiskAssessment, degraded_fallback: bool) -> Self {
        Self {
            batch_id: batch.batch_id.clone(),
            source_id: batch.source_id.clone(),
            member_count: batch.member_ids.len(),
            assessment,
            assessed_at: Utc::now(),
            degraded_fallback,
        }
    }
}
