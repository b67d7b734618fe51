//! Analysis stage: analysis queue → risk scoring → persistence + broadcast.
//!
//! The analysis call is wrapped in the retry executor and the per-dependency
//! circuit breaker. A batch whose analysis cannot complete is dead-lettered
//! for operator reprocessing *and* shipped downstream with the documented
//! fallback assessment (score 50, medium), so the live stream never
//! silently loses a batch.

use std::sync::Arc;
use std::time::Duration;

use sentinel_common::{BoundedQueue, CircuitBreaker, RetryConfig, RetryError, RetryExecutor};
use sentinel_domain::{
    BatchAssessment, BroadcastMessage, DeadLetterJob, DetectionBatch, RiskAssessment,
    SentinelError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::TransientClassifier;
use crate::dlq::DeadLetterService;
use crate::ports::{AnalysisClient, DistributionChannel, EventStore};

/// Worker stage scoring closed batches and distributing the results.
pub struct AnalysisStage {
    queue: BoundedQueue<DetectionBatch>,
    client: Arc<dyn AnalysisClient>,
    events: Arc<dyn EventStore>,
    channel: Arc<dyn DistributionChannel>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor<TransientClassifier>,
    dlq: Arc<DeadLetterService>,
    dequeue_timeout: Duration,
}

impl AnalysisStage {
    /// Wire the stage to its queue, collaborators, and failure handling.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: BoundedQueue<DetectionBatch>,
        client: Arc<dyn AnalysisClient>,
        events: Arc<dyn EventStore>,
        channel: Arc<dyn DistributionChannel>,
        breaker: Arc<CircuitBreaker>,
        retry_config: RetryConfig,
        dlq: Arc<DeadLetterService>,
        dequeue_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            client,
            events,
            channel,
            breaker,
            retry: RetryExecutor::new(retry_config, TransientClassifier),
            dlq,
            dequeue_timeout,
        }
    }

    /// Worker loop: runs until cancelled, draining the queue first.
    pub async fn run_worker(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        info!(worker_id, "analysis worker started");
        loop {
            if cancel.is_cancelled() && self.queue.is_empty() {
                break;
            }
            let Some(batch) = self.queue.dequeue(self.dequeue_timeout).await else {
                if self.queue.is_closed() {
                    break;
                }
                continue;
            };
            self.process(batch).await;
        }
        info!(worker_id, "analysis worker stopped");
    }

    /// Score one batch; failures are routed, never propagated.
    ///
    /// While the analysis circuit is open the attempt closure fast-fails
    /// with `Unavailable`, which the classifier treats as unretryable, so an
    /// open circuit never burns retry budget.
    async fn process(&self, batch: DetectionBatch) {
        let outcome = self
            .retry
            .execute(|| {
                let batch = batch.clone();
                let client = Arc::clone(&self.client);
                let breaker = Arc::clone(&self.breaker);
                async move {
                    if !breaker.is_call_permitted() {
                        return Err(SentinelError::Unavailable("analysis circuit open".into()));
                    }
                    match client.assess(&batch).await {
                        Ok(assessment) => {
                            breaker.record_success();
                            Ok(assessment)
                        }
                        Err(err) => {
                            if err.is_transient() {
                                breaker.record_failure();
                            } else {
                                breaker.record_success();
                            }
                            Err(err)
                        }
                    }
                }
            })
            .await;

        match outcome {
            Ok(assessment) => {
                debug!(
                    batch_id = %batch.batch_id,
                    risk_score = assessment.risk_score,
                    "batch assessed"
                );
                self.finish(&batch, assessment, false).await;
            }
            Err(RetryError::Fatal { source: SentinelError::Unavailable(reason) }) => {
                let _ = self
                    .dlq
                    .record_gated(DeadLetterJob::Analysis(batch.clone()), &reason)
                    .await;
                self.finish(&batch, RiskAssessment::fallback(), true).await;
            }
            Err(RetryError::Fatal { source }) => {
                let _ = self
                    .dlq
                    .record_fatal(DeadLetterJob::Analysis(batch.clone()), &source.to_string())
                    .await;
                self.finish(&batch, RiskAssessment::fallback(), true).await;
            }
            Err(RetryError::Exhausted { attempts, source }) => {
                let _ = self
                    .dlq
                    .record_exhausted(
                        DeadLetterJob::Analysis(batch.clone()),
                        &source.to_string(),
                        attempts,
                    )
                    .await;
                self.finish(&batch, RiskAssessment::fallback(), true).await;
            }
        }
    }

    /// Persist the assessment and publish it to the distribution channel.
    async fn finish(&self, batch: &DetectionBatch, assessment: RiskAssessment, fallback: bool) {
        let assessed = BatchAssessment::new(batch, assessment, fallback);
        if let Err(err) = self.events.store_assessment(&assessed).await {
            // Persistence is off the hot path; distribution continues.
            error!(batch_id = %assessed.batch_id, error = %err, "failed to persist assessment");
        }
        if let Err(err) = self.channel.publish(&BroadcastMessage::event(assessed)).await {
            warn!(batch_id = %batch.batch_id, error = %err, "failed to publish assessment");
        }
    }
}
