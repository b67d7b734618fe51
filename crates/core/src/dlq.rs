//! Dead-letter service: the management interface over the dead-letter
//! store, plus the overflow sink the queues evict into.
//!
//! Records land here from three paths: retry exhaustion, immediately-fatal
//! failures, and queue overflow under the dead-letter policy. Nothing leaves
//! without manual operator intervention; there is no auto-requeue.

use std::sync::Arc;

use async_trait::async_trait;
use sentinel_common::collections::OverflowSink;
use sentinel_common::EnqueueError;
use sentinel_domain::{
    DeadLetterJob, DeadLetterRecord, DetectionBatch, IngestJob, QueueName, Result, SentinelError,
};
use tracing::{error, info, instrument, warn};

use crate::ports::DeadLetterStore;

/// Queue handles the service can return requeued jobs to.
#[derive(Clone)]
pub struct OriginQueues {
    pub ingest: sentinel_common::BoundedQueue<IngestJob>,
    pub analysis: sentinel_common::BoundedQueue<DetectionBatch>,
}

/// Management interface for dead-lettered jobs.
pub struct DeadLetterService {
    store: Arc<dyn DeadLetterStore>,
    origins: OriginQueues,
}

impl DeadLetterService {
    /// Create the service over a store and the origin queues.
    pub fn new(store: Arc<dyn DeadLetterStore>, origins: OriginQueues) -> Self {
        Self { store, origins }
    }

    /// The underlying store, shared with the health surface.
    #[must_use]
    pub fn store(&self) -> Arc<dyn DeadLetterStore> {
        Arc::clone(&self.store)
    }

    /// Record a job whose retry budget was exhausted.
    #[instrument(skip(self, job), fields(queue = %job.source_queue()))]
    pub async fn record_exhausted(
        &self,
        job: DeadLetterJob,
        error_message: &str,
        attempts: u32,
    ) -> Result<String> {
        let record = DeadLetterRecord::new(job, error_message, attempts);
        let record_id = record.record_id.clone();
        warn!(
            record_id = %record_id,
            attempts,
            error = error_message,
            "job dead-lettered after exhausting retries"
        );
        self.store.insert(record).await?;
        Ok(record_id)
    }

    /// Record a job that failed fatally and was never worth retrying.
    #[instrument(skip(self, job), fields(queue = %job.source_queue()))]
    pub async fn record_fatal(&self, job: DeadLetterJob, error_message: &str) -> Result<String> {
        let record = DeadLetterRecord::new(job, error_message, 1);
        let record_id = record.record_id.clone();
        error!(
            record_id = %record_id,
            error = error_message,
            "job dead-lettered with unretryable failure"
        );
        self.store.insert(record).await?;
        Ok(record_id)
    }

    /// Record a job that was gated off before any attempt (open circuit).
    #[instrument(skip(self, job), fields(queue = %job.source_queue()))]
    pub async fn record_gated(&self, job: DeadLetterJob, error_message: &str) -> Result<String> {
        let record = DeadLetterRecord::new(job, error_message, 0);
        let record_id = record.record_id.clone();
        warn!(
            record_id = %record_id,
            error = error_message,
            "job dead-lettered without attempt; dependency circuit open"
        );
        self.store.insert(record).await?;
        Ok(record_id)
    }

    /// All records, most recently failed first.
    pub async fn list(&self) -> Result<Vec<DeadLetterRecord>> {
        self.store.list().await
    }

    /// Inspect one record.
    pub async fn inspect(&self, record_id: &str) -> Result<DeadLetterRecord> {
        self.store
            .get(record_id)
            .await?
            .ok_or_else(|| SentinelError::NotFound(format!("dead-letter record {record_id}")))
    }

    /// Return a record's job to its origin queue and delete the record.
    ///
    /// If the origin queue refuses the job, the record is reinserted so the
    /// job is never lost between the store and the queue.
    #[instrument(skip(self))]
    pub async fn requeue(&self, record_id: &str) -> Result<()> {
        let record = self
            .store
            .remove(record_id)
            .await?
            .ok_or_else(|| SentinelError::NotFound(format!("dead-letter record {record_id}")))?;

        let outcome = match record.job.clone() {
            DeadLetterJob::Ingest(job) => {
                self.origins.ingest.enqueue(job).await.map(|_| ()).map_err(describe_enqueue_error)
            }
            DeadLetterJob::Analysis(batch) => self
                .origins
                .analysis
                .enqueue(batch)
                .await
                .map(|_| ())
                .map_err(describe_enqueue_error),
        };

        match outcome {
            Ok(()) => {
                info!(record_id, queue = %record.source_queue, "dead-letter record requeued");
                Ok(())
            }
            Err(reason) => {
                warn!(record_id, reason = %reason, "requeue refused; restoring record");
                self.store.insert(record).await?;
                Err(SentinelError::Queue(reason))
            }
        }
    }

    /// Delete every record originating from one queue.
    #[instrument(skip(self))]
    pub async fn clear(&self, queue: QueueName) -> Result<usize> {
        let cleared = self.store.clear(queue).await?;
        info!(queue = %queue, cleared, "dead-letter records cleared");
        Ok(cleared)
    }

    /// Record counts per origin queue, for the health surface.
    pub async fn counts(&self) -> Result<Vec<(String, usize)>> {
        let mut counts = Vec::with_capacity(2);
        for queue in [QueueName::Ingest, QueueName::Analysis] {
            counts.push((queue.to_string(), self.store.count(queue).await?));
        }
        Ok(counts)
    }
}

fn describe_enqueue_error<T>(err: EnqueueError<T>) -> String {
    match err {
        EnqueueError::Rejected(_) => "origin queue is full".to_string(),
        EnqueueError::Closed(_) => "origin queue is closed".to_string(),
    }
}

/// Overflow sink that preserves queue-evicted items as dead-letter records.
pub struct DeadLetterOverflowSink {
    store: Arc<dyn DeadLetterStore>,
}

impl DeadLetterOverflowSink {
    /// Create a sink writing into the given store.
    pub fn new(store: Arc<dyn DeadLetterStore>) -> Self {
        Self { store }
    }

    async fn absorb_jobs(&self, jobs: Vec<DeadLetterJob>, source_queue: &str) {
        for job in jobs {
            let record = DeadLetterRecord::new(job, "evicted by queue overflow", 0);
            if let Err(err) = self.store.insert(record).await {
                // Last-resort path: the item is lost only if the store
                // itself fails, which is worth an error-level trace.
                error!(queue = source_queue, error = %err, "failed to preserve evicted item");
            }
        }
    }
}

#[async_trait]
impl OverflowSink<IngestJob> for DeadLetterOverflowSink {
    async fn absorb(&self, items: Vec<IngestJob>, source_queue: &str) {
        let jobs = items.into_iter().map(DeadLetterJob::Ingest).collect();
        self.absorb_jobs(jobs, source_queue).await;
    }
}

#[async_trait]
impl OverflowSink<DetectionBatch> for DeadLetterOverflowSink {
    async fn absorb(&self, items: Vec<DetectionBatch>, source_queue: &str) {
        let jobs = items.into_iter().map(DeadLetterJob::Analysis).collect();
        self.absorb_jobs(jobs, source_queue).await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use dashmap::DashMap;
    use sentinel_common::BoundedQueue;
    use sentinel_domain::JobPayload;

    use super::*;

    /// Minimal in-memory store for exercising the service.
    #[derive(Default)]
    struct MapStore {
        records: DashMap<String, DeadLetterRecord>,
    }

    #[async_trait]
    impl DeadLetterStore for MapStore {
        async fn insert(&self, record: DeadLetterRecord) -> Result<()> {
            self.records.insert(record.record_id.clone(), record);
            Ok(())
        }

        async fn list(&self) -> Result<Vec<DeadLetterRecord>> {
            let mut records: Vec<_> =
                self.records.iter().map(|entry| entry.value().clone()).collect();
            records.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at));
            Ok(records)
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

    fn sample_job(source: &str) -> IngestJob {
        IngestJob::new(
            source,
            JobPayload::CameraFrame { frame_ref: "frame".to_string(), captured_at: Utc::now() },
        )
    }

    fn service() -> (DeadLetterService, Arc<MapStore>, OriginQueues) {
        let store = Arc::new(MapStore::default());
        let origins = OriginQueues {
            ingest: BoundedQueue::new("ingest", 4),
            analysis: BoundedQueue::new("analysis", 4),
        };
        let service = DeadLetterService::new(store.clone(), origins.clone());
        (service, store, origins)
    }

    #[tokio::test]
    async fn requeue_returns_job_to_origin_and_removes_record() {
        let (service, store, origins) = service();

        let record_id = service
            .record_exhausted(DeadLetterJob::Ingest(sample_job("cam1")), "timeout", 4)
            .await
            .unwrap();

        service.requeue(&record_id).await.unwrap();

        assert_eq!(origins.ingest.len(), 1);
        assert!(store.get(&record_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeue_restores_record_when_queue_full() {
        let (service, store, origins) = service();
        for i in 0..4 {
            origins.ingest.enqueue(sample_job(&format!("cam{i}"))).await.unwrap();
        }

        let record_id = service
            .record_exhausted(DeadLetterJob::Ingest(sample_job("cam9")), "timeout", 2)
            .await
            .unwrap();

        let result = service.requeue(&record_id).await;
        assert!(matches!(result, Err(SentinelError::Queue(_))));
        assert!(store.get(&record_id).await.unwrap().is_some(), "record must survive");
    }

    #[tokio::test]
    async fn clear_only_empties_one_queue() {
        let (service, _store, _origins) = service();

        service
            .record_fatal(DeadLetterJob::Ingest(sample_job("cam1")), "bad payload")
            .await
            .unwrap();
        let batch = DetectionBatch {
            batch_id: "b1".to_string(),
            source_id: "cam1".to_string(),
            member_ids: vec!["m1".to_string()],
            started_at: Utc::now(),
            ended_at: Utc::now(),
        };
        service
            .record_exhausted(DeadLetterJob::Analysis(batch), "llm unreachable", 4)
            .await
            .unwrap();

        let cleared = service.clear(QueueName::Ingest).await.unwrap();
        assert_eq!(cleared, 1);

        let counts = service.counts().await.unwrap();
        assert!(counts.contains(&("ingest".to_string(), 0)));
        assert!(counts.contains(&("analysis".to_string(), 1)));
    }

    #[tokio::test]
    async fn inspect_missing_record_is_not_found() {
        let (service, _store, _origins) = service();
        assert!(matches!(
            service.inspect("missing").await,
            Err(SentinelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn overflow_sink_preserves_evicted_items() {
        let store = Arc::new(MapStore::default());
        let sink = DeadLetterOverflowSink::new(store.clone());

        sink.absorb(vec![sample_job("cam1"), sample_job("cam2")], "ingest").await;

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.attempt_count == 0));
        assert!(records.iter().all(|r| r.source_queue == QueueName::Ingest));
    }
}
