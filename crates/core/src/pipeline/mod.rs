//! Worker stages consuming the pipeline queues.
//!
//! Both stages follow the same loop discipline: park on the queue with a
//! bounded timeout, process one item at a time, and never let a single bad
//! item kill the loop: failures are classified, retried under backoff, and
//! routed to the dead-letter service when the budget runs out.

pub mod dispatch;
pub mod ingest;

use sentinel_common::{FailureClassifier, FailureKind};
use sentinel_domain::SentinelError;

pub use dispatch::AnalysisStage;
pub use ingest::DetectionStage;

/// Routes [`SentinelError`]s into the retry executor's taxonomy using the
/// domain's own transience classification.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientClassifier;

impl FailureClassifier<SentinelError> for TransientClassifier {
    fn classify(&self, error: &SentinelError) -> FailureKind {
        if error.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::Fatal
        }
    }
}
