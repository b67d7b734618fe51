//! Health surface: one snapshot describing queues, DLQ depth, breakers, and
//! broadcast state.

use std::sync::Arc;

use chrono::Utc;
use sentinel_common::{BoundedQueue, CircuitBreakerRegistry, QueueMetrics};
use sentinel_domain::{
    BreakerHealth, DetectionBatch, HealthSnapshot, IngestJob, QueueHealth, Result,
};

use crate::broadcast::Broadcaster;
use crate::dlq::DeadLetterService;

/// Assembles [`HealthSnapshot`]s for operators and monitoring.
pub struct HealthService {
    ingest: BoundedQueue<IngestJob>,
    analysis: BoundedQueue<DetectionBatch>,
    dlq: Arc<DeadLetterService>,
    registry: Arc<CircuitBreakerRegistry>,
    broadcaster: Arc<Broadcaster>,
}

impl HealthService {
    /// Wire the service to the live pipeline components.
    pub fn new(
        ingest: BoundedQueue<IngestJob>,
        analysis: BoundedQueue<DetectionBatch>,
        dlq: Arc<DeadLetterService>,
        registry: Arc<CircuitBreakerRegistry>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self { ingest, analysis, dlq, registry, broadcaster }
    }

    /// Produce a point-in-time snapshot of pipeline health.
    pub async fn snapshot(&self) -> Result<HealthSnapshot> {
        let queues =
            vec![queue_health(self.ingest.metrics()), queue_health(self.analysis.metrics())];

        let breakers = self
            .registry
            .snapshot_all()
            .into_iter()
            .map(|(dependency, snapshot)| BreakerHealth {
                dependency,
                state: snapshot.state.to_string(),
                consecutive_failures: snapshot.consecutive_failures,
                consecutive_successes: snapshot.consecutive_successes,
                rejected_calls: snapshot.rejected_calls,
            })
            .collect();

        Ok(HealthSnapshot {
            queues,
            dead_letters: self.dlq.counts().await?,
            breakers,
            broadcast_degraded: self.broadcaster.is_degraded(),
            generated_at: Utc::now(),
        })
    }
}

fn queue_health(metrics: QueueMetrics) -> QueueHealth {
    QueueHealth {
        under_pressure: metrics.under_pressure(),
        name: metrics.name,
        len: metrics.len,
        capacity: metrics.capacity,
        fill_ratio: metrics.fill_ratio,
        rejected: metrics.rejected,
        dead_lettered: metrics.dead_lettered,
        dropped: metrics.dropped,
    }
}
