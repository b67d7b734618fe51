//! In-memory key-value store with per-entry expiry for open-batch
//! snapshots.
//!
//! Expiry is the safety net against immortal state, never a closure path:
//! purging an entry that still carries members is logged loudly, and the
//! aggregator refreshes the expiry on every append so a live batch is never
//! purged.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use sentinel_core::ports::BatchStateStore;
use sentinel_domain::{OpenBatchSnapshot, Result};
use tracing::warn;

struct Entry {
    snapshot: OpenBatchSnapshot,
    expires_at: Instant,
}

/// Concurrent map-backed [`BatchStateStore`] with lazy expiry.
#[derive(Default)]
pub struct InMemoryBatchStateStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryBatchStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|source_id, entry| {
            let live = entry.expires_at > now;
            if !live {
                warn!(
                    source = %source_id,
                    batch_id = %entry.snapshot.batch_id,
                    members = entry.snapshot.member_ids.len(),
                    "expiring stale open-batch snapshot"
                );
            }
            live
        });
    }
}

#[async_trait]
impl BatchStateStore for InMemoryBatchStateStore {
    async fn put(&self, snapshot: &OpenBatchSnapshot, ttl: Duration) -> Result<()> {
        self.entries.insert(
            snapshot.source_id.clone(),
            Entry { snapshot: snapshot.clone(), expires_at: Instant::now() + ttl },
        );
        Ok(())
    }

    async fn get(&self, source_id: &str) -> Result<Option<OpenBatchSnapshot>> {
        self.purge_expired();
        Ok(self.entries.get(source_id).map(|entry| entry.snapshot.clone()))
    }

    async fn remove(&self, source_id: &str) -> Result<()> {
        self.entries.remove(source_id);
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<OpenBatchSnapshot>> {
        self.purge_expired();
        Ok(self.entries.iter().map(|entry| entry.snapshot.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn snapshot(source: &str) -> OpenBatchSnapshot {
        OpenBatchSnapshot {
            batch_id: "b1".to_string(),
            source_id: source.to_string(),
            member_ids: vec!["m1".to_string()],
            started_at: Utc::now(),
            last_activity_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_get_remove_round_trip() {
        let store = InMemoryBatchStateStore::new();
        store.put(&snapshot("cam1"), Duration::from_secs(60)).await.unwrap();

        assert!(store.get("cam1").await.unwrap().is_some());
        assert_eq!(store.scan().await.unwrap().len(), 1);

        store.remove("cam1").await.unwrap();
        assert!(store.get("cam1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_vanish() {
        let store = InMemoryBatchStateStore::new();
        store.put(&snapshot("cam1"), Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.get("cam1").await.unwrap().is_none());
        assert!(store.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_extends_expiry() {
        let store = InMemoryBatchStateStore::new();
        store.put(&snapshot("cam1"), Duration::from_millis(40)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        store.put(&snapshot("cam1"), Duration::from_millis(40)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(store.get("cam1").await.unwrap().is_some(), "refreshed entry must survive");
    }
}
