//! In-memory dead-letter store.
//!
//! Records live for the life of the process; the management interface in
//! `sentinel-core` is the only writer besides the pipeline's failure paths.

use async_trait::async_trait;
use dashmap::DashMap;
use sentinel_core::ports::DeadLetterStore;
use sentinel_domain::{DeadLetterRecord, QueueName, Result};

/// Concurrent map-backed [`DeadLetterStore`].
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    records: DashMap<String, DeadLetterRecord>,
}

impl InMemoryDeadLetterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
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

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use sentinel_domain::{DeadLetterJob, IngestJob, JobPayload};

    use super::*;

    fn record(source: &str) -> DeadLetterRecord {
        DeadLetterRecord::new(
            DeadLetterJob::Ingest(IngestJob::new(
                source,
                JobPayload::CameraFrame { frame_ref: "f".to_string(), captured_at: Utc::now() },
            )),
            "failed",
            3,
        )
    }

    #[tokio::test]
    async fn insert_get_remove_round_trip() {
        let store = InMemoryDeadLetterStore::new();
        let rec = record("cam1");
        let id = rec.record_id.clone();

        store.insert(rec).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_some());
        assert_eq!(store.count(QueueName::Ingest).await.unwrap(), 1);

        let removed = store.remove(&id).await.unwrap().unwrap();
        assert_eq!(removed.record_id, id);
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_orders_most_recent_first() {
        let store = InMemoryDeadLetterStore::new();
        let mut older = record("cam1");
        older.last_failed_at = Utc::now() - chrono::Duration::minutes(5);
        let newer = record("cam2");

        store.insert(older).await.unwrap();
        store.insert(newer.clone()).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed[0].record_id, newer.record_id);
    }

    #[tokio::test]
    async fn clear_is_scoped_to_queue() {
        let store = InMemoryDeadLetterStore::new();
        store.insert(record("cam1")).await.unwrap();

        assert_eq!(store.clear(QueueName::Analysis).await.unwrap(), 0);
        assert_eq!(store.clear(QueueName::Ingest).await.unwrap(), 1);
        assert_eq!(store.count(QueueName::Ingest).await.unwrap(), 0);
    }
}
