//! Detection stage: ingest queue → object detection → aggregator.

use std::sync::Arc;
use std::time::Duration;

use sentinel_common::{BoundedQueue, CircuitBreaker, RetryConfig, RetryError, RetryExecutor};
use sentinel_domain::{
    DeadLetterJob, Detection, DetectionRecord, IngestJob, SentinelError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::TransientClassifier;
use crate::aggregator::BatchAggregator;
use crate::dlq::DeadLetterService;
use crate::ports::{DetectionClient, EventStore};

/// Worker stage consuming ingest jobs and feeding detections to the
/// aggregator.
pub struct DetectionStage {
    queue: BoundedQueue<IngestJob>,
    client: Arc<dyn DetectionClient>,
    events: Arc<dyn EventStore>,
    aggregator: Arc<BatchAggregator>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor<TransientClassifier>,
    dlq: Arc<DeadLetterService>,
    dequeue_timeout: Duration,
}

impl DetectionStage {
    /// Wire the stage to its queue, collaborators, and failure handling.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: BoundedQueue<IngestJob>,
        client: Arc<dyn DetectionClient>,
        events: Arc<dyn EventStore>,
        aggregator: Arc<BatchAggregator>,
        breaker: Arc<CircuitBreaker>,
        retry_config: RetryConfig,
        dlq: Arc<DeadLetterService>,
        dequeue_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            client,
            events,
            aggregator,
            breaker,
            retry: RetryExecutor::new(retry_config, TransientClassifier),
            dlq,
            dequeue_timeout,
        }
    }

    /// Worker loop: runs until cancelled, draining the queue first.
    pub async fn run_worker(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        info!(worker_id, "detection worker started");
        loop {
            if cancel.is_cancelled() && self.queue.is_empty() {
                break;
            }
            let Some(job) = self.queue.dequeue(self.dequeue_timeout).await else {
                if self.queue.is_closed() {
                    break;
                }
                continue;
            };
            self.process(job).await;
        }
        info!(worker_id, "detection worker stopped");
    }

    /// Process one job; failures are routed, never propagated.
    ///
    /// While the detector circuit is open the attempt closure fast-fails
    /// with `Unavailable`, which the classifier treats as unretryable, so an
    /// open circuit never burns retry budget.
    async fn process(&self, job: IngestJob) {
        let outcome = self
            .retry
            .execute(|| {
                let payload = job.payload.clone();
                let client = Arc::clone(&self.client);
                let breaker = Arc::clone(&self.breaker);
                async move {
                    if !breaker.is_call_permitted() {
                        return Err(SentinelError::Unavailable("detection circuit open".into()));
                    }
                    match client.detect(&payload).await {
                        Ok(detections) => {
                            breaker.record_success();
                            Ok(detections)
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
            Ok(detections) => self.forward(&job, detections).await,
            Err(RetryError::Fatal { source: SentinelError::Unavailable(reason) }) => {
                let _ = self.dlq.record_gated(DeadLetterJob::Ingest(job), &reason).await;
            }
            Err(RetryError::Fatal { source }) => {
                let _ =
                    self.dlq.record_fatal(DeadLetterJob::Ingest(job), &source.to_string()).await;
            }
            Err(RetryError::Exhausted { attempts, source }) => {
                let _ = self
                    .dlq
                    .record_exhausted(DeadLetterJob::Ingest(job), &source.to_string(), attempts)
                    .await;
            }
        }
    }

    /// Persist each detection and hand it to the aggregator.
    async fn forward(&self, job: &IngestJob, detections: Vec<Detection>) {
        if detections.is_empty() {
            debug!(source = %job.source_id, "frame produced no detections");
            return;
        }
        for detection in detections {
            let record = DetectionRecord::new(job.source_id.clone(), detection);
            if let Err(err) = self.events.store_detection(&record).await {
                // Persistence is off the hot path; real-time flow continues.
                error!(record_id = %record.id, error = %err, "failed to persist detection");
            }
            if let Err(err) = self.aggregator.offer(&record).await {
                warn!(record_id = %record.id, error = %err, "aggregator refused detection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use dashmap::DashMap;
    use parking_lot::Mutex;
    use sentinel_common::CircuitBreakerConfig;
    use sentinel_domain::{
        AggregatorConfig, BatchAssessment, BoundingBox, DeadLetterRecord, DetectionBatch,
        DetectionFilter, JobPayload, OpenBatchSnapshot, QueueName, Result,
    };

    use super::*;
    use crate::dlq::OriginQueues;
    use crate::ports::{BatchStateStore, DeadLetterStore};

    struct ScriptedDetector {
        calls: AtomicU32,
        failures_before_success: u32,
        error: fn(String) -> SentinelError,
    }

    #[async_trait]
    impl DetectionClient for ScriptedDetector {
        async fn detect(&self, _payload: &JobPayload) -> Result<Vec<Detection>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err((self.error)("detector failure".to_string()))
            } else {
                Ok(vec![Detection {
                    object_type: "person".to_string(),
                    confidence: 0.8,
                    bbox: BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0 },
                }])
            }
        }
    }

    #[derive(Default)]
    struct VecEventStore {
        detections: Mutex<Vec<DetectionRecord>>,
    }

    #[async_trait]
    impl EventStore for VecEventStore {
        async fn store_detection(&self, record: &DetectionRecord) -> Result<()> {
            self.detections.lock().push(record.clone());
            Ok(())
        }

        async fn store_assessment(&self, _assessment: &BatchAssessment) -> Result<()> {
            Ok(())
        }

        async fn query_detections(
            &self,
            _filter: &DetectionFilter,
        ) -> Result<Vec<DetectionRecord>> {
            Ok(self.detections.lock().clone())
        }
    }

    #[derive(Default)]
    struct NullStateStore;

    #[async_trait]
    impl BatchStateStore for NullStateStore {
        async fn put(&self, _snapshot: &OpenBatchSnapshot, _ttl: Duration) -> Result<()> {
            Ok(())
        }
        async fn get(&self, _source_id: &str) -> Result<Option<OpenBatchSnapshot>> {
            Ok(None)
        }
        async fn remove(&self, _source_id: &str) -> Result<()> {
            Ok(())
        }
        async fn scan(&self) -> Result<Vec<OpenBatchSnapshot>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct MapDlqStore {
        records: DashMap<String, DeadLetterRecord>,
    }

    #[async_trait]
    impl DeadLetterStore for MapDlqStore {
        async fn insert(&self, record: DeadLetterRecord) -> Result<()> {
            self.records.insert(record.record_id.clone(), record);
            Ok(())
        }
        async fn list(&self) -> Result<Vec<DeadLetterRecord>> {
            Ok(self.records.iter().map(|entry| entry.value().clone()).collect())
        }
        async fn get(&self, record_id: &str) -> Result<Option<DeadLetterRecord>> {
            Ok(self.records.get(record_id).map(|entry| entry.value().clone()))
        }
        async fn remove(&self, record_id: &str) -> Result<Option<DeadLetterRecord>> {
            Ok(self.records.remove(record_id).map(|(_, record)| record))
        }
        async fn clear(&self, queue: QueueName) -> Result<usize> {
            let before = self.records.len();
            self.records.retain(|_, record| record.source_queue != queue);
            Ok(before - self.records.len())
        }
        async fn count(&self, queue: QueueName) -> Result<usize> {
            Ok(self.records.iter().filter(|entry| entry.source_queue == queue).count())
        }
    }

    struct Fixture {
        stage: Arc<DetectionStage>,
        events: Arc<VecEventStore>,
        dlq_store: Arc<MapDlqStore>,
        downstream: BoundedQueue<DetectionBatch>,
        breaker: Arc<CircuitBreaker>,
    }

    fn fixture(detector: ScriptedDetector, max_retries: u32) -> Fixture {
        let ingest = BoundedQueue::new("ingest", 16);
        let downstream = BoundedQueue::new("analysis", 16);
        let events = Arc::new(VecEventStore::default());
        let dlq_store = Arc::new(MapDlqStore::default());
        let aggregator = Arc::new(BatchAggregator::new(
            AggregatorConfig::default(),
            downstream.clone(),
            Arc::new(NullStateStore),
        ));
        let breaker = Arc::new(
            CircuitBreaker::new("detection", CircuitBreakerConfig::default()).unwrap(),
        );
        let dlq = Arc::new(DeadLetterService::new(
            dlq_store.clone(),
            OriginQueues { ingest: ingest.clone(), analysis: downstream.clone() },
        ));
        let retry = RetryConfig::builder()
            .max_retries(max_retries)
            .base_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .jitter(false)
            .build()
            .unwrap();
        let stage = Arc::new(DetectionStage::new(
            ingest,
            Arc::new(detector),
            events.clone(),
            aggregator,
            breaker.clone(),
            retry,
            dlq,
            Duration::from_millis(10),
        ));
        Fixture { stage, events, dlq_store, downstream, breaker }
    }

    fn job() -> IngestJob {
        IngestJob::new(
            "cam1",
            JobPayload::CameraFrame { frame_ref: "f-1".to_string(), captured_at: Utc::now() },
        )
    }

    #[tokio::test]
    async fn successful_detection_persists_and_aggregates() {
        let detector =
            ScriptedDetector { calls: AtomicU32::new(0), failures_before_success: 0, error: SentinelError::Network };
        let f = fixture(detector, 2);

        f.stage.process(job()).await;

        assert_eq!(f.events.detections.lock().len(), 1);
        assert!(f.dlq_store.records.is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let detector =
            ScriptedDetector { calls: AtomicU32::new(0), failures_before_success: 2, error: SentinelError::Network };
        let f = fixture(detector, 3);

        f.stage.process(job()).await;

        assert_eq!(f.events.detections.lock().len(), 1);
        assert!(f.dlq_store.records.is_empty());
    }

    #[tokio::test]
    async fn exhausted_job_is_dead_lettered_with_attempts() {
        let detector = ScriptedDetector {
            calls: AtomicU32::new(0),
            failures_before_success: u32::MAX,
            error: SentinelError::Network,
        };
        let f = fixture(detector, 2);

        f.stage.process(job()).await;

        let records = f.dlq_store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempt_count, 3);
        assert_eq!(records[0].source_queue, QueueName::Ingest);
        assert!(f.events.detections.lock().is_empty());
    }

    #[tokio::test]
    async fn fatal_failure_dead_letters_without_retry() {
        let detector = ScriptedDetector {
            calls: AtomicU32::new(0),
            failures_before_success: u32::MAX,
            error: SentinelError::InvalidInput,
        };
        let f = fixture(detector, 5);

        f.stage.process(job()).await;

        let records = f.dlq_store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempt_count, 1, "fatal failures must not consume retries");
    }

    #[tokio::test]
    async fn open_circuit_gates_job_into_dlq() {
        let detector =
            ScriptedDetector { calls: AtomicU32::new(0), failures_before_success: 0, error: SentinelError::Network };
        let f = fixture(detector, 2);

        // Trip the detector breaker.
        for _ in 0..5 {
            f.breaker.record_failure();
        }

        f.stage.process(job()).await;

        let records = f.dlq_store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempt_count, 0);
        assert!(records[0].error_message.contains("circuit open"));
    }

    #[tokio::test]
    async fn worker_drains_queue_and_stops_on_cancel() {
        let detector =
            ScriptedDetector { calls: AtomicU32::new(0), failures_before_success: 0, error: SentinelError::Network };
        let f = fixture(detector, 2);

        f.stage.queue.enqueue(job()).await.unwrap();
        f.stage.queue.enqueue(job()).await.unwrap();

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&f.stage).run_worker(0, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();

        assert_eq!(f.events.detections.lock().len(), 2);
        drop(f.downstream);
    }
}
