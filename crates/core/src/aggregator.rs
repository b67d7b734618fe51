//! Per-source batch aggregation with window and idle timers.
//!
//! Each source walks a `NoBatch → Active → Closed` state machine. The first
//! item for an idle source opens a batch; later items append and bump the
//! activity timestamp; a periodic sweep closes batches whose window cap or
//! idle deadline has passed and pushes them onto the analysis queue as one
//! unit. Closure and arrival for the same source serialize on one per-source
//! lock, so an item arriving during closure either joins the closing batch
//! or opens a fresh one; it is never lost.
//!
//! Every open batch is mirrored into an external key-value store with an
//! expiry strictly greater than the window cap. The mirror is crash
//! recovery and visibility only; at startup [`BatchAggregator::recover_orphans`]
//! re-emits whatever a previous run left behind instead of letting expiry
//! silently discard accumulated members.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sentinel_common::{BoundedQueue, Clock, EnqueueOutcome, SystemClock};
use sentinel_domain::{
    AggregatorConfig, DetectionBatch, DetectionRecord, OpenBatchSnapshot, Result, SourceId,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Mutable state of one open batch.
///
/// Deadlines use monotonic instants; the UTC timestamps ride along for the
/// emitted batch and the mirrored snapshot.
struct OpenBatch {
    batch_id: String,
    member_ids: Vec<String>,
    opened_at: Instant,
    last_activity: Instant,
    opened_at_utc: DateTime<Utc>,
    last_activity_utc: DateTime<Utc>,
}

impl OpenBatch {
    fn new(now: Instant) -> Self {
        let now_utc = Utc::now();
        Self {
            batch_id: Uuid::now_v7().to_string(),
            member_ids: Vec::new(),
            opened_at: now,
            last_activity: now,
            opened_at_utc: now_utc,
            last_activity_utc: now_utc,
        }
    }

    fn snapshot(&self, source_id: &str) -> OpenBatchSnapshot {
        OpenBatchSnapshot {
            batch_id: self.batch_id.clone(),
            source_id: source_id.to_string(),
            member_ids: self.member_ids.clone(),
            started_at: self.opened_at_utc,
            last_activity_at: self.last_activity_utc,
        }
    }

    fn into_batch(self, source_id: SourceId) -> DetectionBatch {
        DetectionBatch {
            batch_id: self.batch_id,
            source_id,
            member_ids: self.member_ids,
            started_at: self.opened_at_utc,
            ended_at: self.last_activity_utc,
        }
    }
}

type SourceSlot = Arc<Mutex<Option<OpenBatch>>>;

/// Groups detections into per-source, time-windowed batches.
pub struct BatchAggregator {
    config: AggregatorConfig,
    sources: DashMap<SourceId, SourceSlot>,
    downstream: BoundedQueue<DetectionBatch>,
    state_store: Arc<dyn crate::ports::BatchStateStore>,
    clock: Arc<dyn Clock>,
}

impl BatchAggregator {
    /// Create an aggregator emitting onto `downstream`.
    pub fn new(
        config: AggregatorConfig,
        downstream: BoundedQueue<DetectionBatch>,
        state_store: Arc<dyn crate::ports::BatchStateStore>,
    ) -> Self {
        Self::with_clock(config, downstream, state_store, Arc::new(SystemClock))
    }

    /// Create an aggregator with a custom clock (used by tests).
    pub fn with_clock(
        config: AggregatorConfig,
        downstream: BoundedQueue<DetectionBatch>,
        state_store: Arc<dyn crate::ports::BatchStateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, sources: DashMap::new(), downstream, state_store, clock }
    }

    /// Whether a detection bypasses aggregation entirely.
    fn is_fast_path(&self, record: &DetectionRecord) -> bool {
        let fast_path = &self.config.fast_path;
        record.detection.confidence >= fast_path.min_confidence
            && fast_path
                .critical_types
                .iter()
                .any(|class| class.eq_ignore_ascii_case(&record.detection.object_type))
    }

    /// Route one detection: fast-path records dispatch immediately as
    /// singleton batches, everything else joins (or opens) the source's
    /// batch.
    ///
    /// Fast-path dispatch is idempotent-safe by design: two racing
    /// fast-path items may produce two singleton batches, and that is
    /// tolerated rather than deduplicated. The source's open batch is left
    /// untouched either way.
    #[instrument(skip(self, record), fields(source = %record.source_id))]
    pub async fn offer(&self, record: &DetectionRecord) -> Result<()> {
        if self.is_fast_path(record) {
            let batch = DetectionBatch::singleton(record);
            debug!(
                batch_id = %batch.batch_id,
                object_type = %record.detection.object_type,
                "fast-path detection dispatched as singleton batch"
            );
            self.push_downstream(batch).await;
            return Ok(());
        }

        let slot = self
            .sources
            .entry(record.source_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let now = self.clock.now();
        let mut guard = slot.lock().await;
        let opened = guard.is_none();
        let batch = guard.get_or_insert_with(|| OpenBatch::new(now));
        if opened {
            debug!(batch_id = %batch.batch_id, "opened batch for source");
        } else {
            batch.last_activity = now;
            batch.last_activity_utc = Utc::now();
        }
        batch.member_ids.push(record.id.clone());

        let snapshot = batch.snapshot(&record.source_id);
        // Mirror while still holding the source lock so the stored state
        // never runs ahead of the in-memory state. Failures here degrade
        // crash recovery, not correctness.
        if let Err(err) = self.state_store.put(&snapshot, self.config.state_ttl).await {
            warn!(source = %record.source_id, error = %err, "failed to mirror open batch state");
        }
        Ok(())
    }

    /// Close every batch whose window cap or idle deadline has passed.
    ///
    /// Returns the number of batches closed. Runs from the periodic sweep
    /// task, not on item arrival, so deadlines fire even when a source goes
    /// silent.
    pub async fn sweep_once(&self) -> usize {
        let now = self.clock.now();
        let slots: Vec<(SourceId, SourceSlot)> =
            self.sources.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect();

        let mut closed = 0;
        for (source_id, slot) in slots {
            let expired = {
                let mut guard = slot.lock().await;
                let due = guard.as_ref().is_some_and(|batch| {
                    now.duration_since(batch.opened_at) >= self.config.window_duration
                        || now.duration_since(batch.last_activity) >= self.config.idle_duration
                });
                if due {
                    guard.take()
                } else {
                    None
                }
            };

            if let Some(batch) = expired {
                let hit_window_cap =
                    now.duration_since(batch.opened_at) >= self.config.window_duration;
                debug!(
                    source = %source_id,
                    batch_id = %batch.batch_id,
                    members = batch.member_ids.len(),
                    window_cap = hit_window_cap,
                    "closing batch"
                );
                self.emit(&source_id, batch).await;
                closed += 1;
            }
        }
        closed
    }

    /// Emit one closed batch downstream and clear its mirrored state.
    async fn emit(&self, source_id: &str, batch: OpenBatch) {
        let emission = batch.into_batch(source_id.to_string());
        if self.push_downstream(emission).await {
            if let Err(err) = self.state_store.remove(source_id).await {
                warn!(source = source_id, error = %err, "failed to clear mirrored batch state");
            }
        }
        // On enqueue failure the mirrored snapshot is deliberately kept, so
        // the batch is recoverable as an orphan.
    }

    async fn push_downstream(&self, batch: DetectionBatch) -> bool {
        let batch_id = batch.batch_id.clone();
        match self.downstream.enqueue(batch).await {
            Ok(EnqueueOutcome::Accepted) => true,
            Ok(EnqueueOutcome::MovedToDeadLetter(evicted)) => {
                warn!(batch_id = %batch_id, evicted, "analysis queue full; evicted oldest to DLQ");
                true
            }
            Ok(EnqueueOutcome::DroppedOldest(dropped)) => {
                warn!(batch_id = %batch_id, dropped, "analysis queue full; dropped oldest");
                true
            }
            Err(err) => {
                warn!(batch_id = %batch_id, error = %err, "failed to emit batch downstream");
                false
            }
        }
    }

    /// Re-emit open-batch snapshots left behind by a crashed run.
    ///
    /// Called once during startup, before workers begin; accumulated members
    /// flow downstream instead of being dropped by expiry.
    pub async fn recover_orphans(&self) -> Result<usize> {
        let orphans = self.state_store.scan().await?;
        let mut recovered = 0;
        for snapshot in orphans {
            let source_id = snapshot.source_id.clone();
            info!(
                source = %source_id,
                batch_id = %snapshot.batch_id,
                members = snapshot.member_ids.len(),
                "recovering orphaned batch"
            );
            if self.push_downstream(snapshot.into_batch()).await {
                self.state_store.remove(&source_id).await?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Number of currently open batches (one per active source).
    #[must_use]
    pub fn open_batches(&self) -> usize {
        self.sources
            .iter()
            .filter(|entry| entry.value().try_lock().map(|guard| guard.is_some()).unwrap_or(true))
            .count()
    }

    /// Periodic sweep loop; runs until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.config.sweep_interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("aggregator sweep loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    let closed = self.sweep_once().await;
                    if closed > 0 {
                        debug!(closed, "sweep closed batches");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use dashmap::DashMap;
    use sentinel_common::MockClock;
    use sentinel_domain::{BoundingBox, Detection};

    use super::*;
    use crate::ports::BatchStateStore;

    /// In-memory state store that records puts/removes for assertions.
    #[derive(Default)]
    struct TestStateStore {
        entries: DashMap<String, OpenBatchSnapshot>,
    }

    #[async_trait]
    impl crate::ports::BatchStateStore for TestStateStore {
        async fn put(&self, snapshot: &OpenBatchSnapshot, _ttl: Duration) -> Result<()> {
            self.entries.insert(snapshot.source_id.clone(), snapshot.clone());
            Ok(())
        }

        async fn get(&self, source_id: &str) -> Result<Option<OpenBatchSnapshot>> {
            Ok(self.entries.get(source_id).map(|entry| entry.value().clone()))
        }

        async fn remove(&self, source_id: &str) -> Result<()> {
            self.entries.remove(source_id);
            Ok(())
        }

        async fn scan(&self) -> Result<Vec<OpenBatchSnapshot>> {
            Ok(self.entries.iter().map(|entry| entry.value().clone()).collect())
        }
    }

    fn record(source: &str, object_type: &str, confidence: f32) -> DetectionRecord {
        DetectionRecord::new(
            source,
            Detection {
                object_type: object_type.to_string(),
                confidence,
                bbox: BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0 },
            },
        )
    }

    struct Fixture {
        aggregator: Arc<BatchAggregator>,
        downstream: BoundedQueue<DetectionBatch>,
        clock: Arc<MockClock>,
        store: Arc<TestStateStore>,
    }

    fn fixture(window: Duration, idle: Duration) -> Fixture {
        let downstream = BoundedQueue::new("analysis", 16);
        let clock = Arc::new(MockClock::new());
        let store = Arc::new(TestStateStore::default());
        let config = AggregatorConfig {
            window_duration: window,
            idle_duration: idle,
            sweep_interval: Duration::from_millis(10),
            state_ttl: window * 2,
            ..AggregatorConfig::default()
        };
        let aggregator = Arc::new(BatchAggregator::with_clock(
            config,
            downstream.clone(),
            store.clone(),
            clock.clone(),
        ));
        Fixture { aggregator, downstream, clock, store }
    }

    /// A source with one item then silence closes at the idle deadline with
    /// exactly one member.
    #[tokio::test]
    async fn idle_timeout_closes_single_member_batch() {
        let f = fixture(Duration::from_secs(90), Duration::from_secs(30));

        f.aggregator.offer(&record("cam1", "person", 0.5)).await.unwrap();
        assert_eq!(f.aggregator.sweep_once().await, 0);

        f.clock.advance(Duration::from_secs(29));
        assert_eq!(f.aggregator.sweep_once().await, 0);

        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.aggregator.sweep_once().await, 1);

        let batch = f.downstream.try_dequeue().expect("closed batch emitted");
        assert_eq!(batch.source_id, "cam1");
        assert_eq!(batch.member_ids.len(), 1);
        assert!(f.store.entries.is_empty(), "mirrored state cleared on close");
    }

    /// A source that never idles is still force-closed at the window cap.
    #[tokio::test]
    async fn window_cap_closes_never_idle_source() {
        let window = Duration::from_secs(90);
        let idle = Duration::from_secs(30);
        let f = fixture(window, idle);

        // One item every idle-ε seconds: the idle deadline never fires.
        let step = Duration::from_secs(29);
        let mut elapsed = Duration::ZERO;
        let mut members = 0;
        while elapsed < window {
            f.aggregator.offer(&record("cam1", "person", 0.5)).await.unwrap();
            members += 1;
            assert_eq!(f.aggregator.sweep_once().await, 0, "no close before the cap");
            f.clock.advance(step);
            elapsed += step;
        }

        assert_eq!(f.aggregator.sweep_once().await, 1, "window cap must force closure");
        let batch = f.downstream.try_dequeue().expect("batch emitted at cap");
        assert_eq!(batch.member_ids.len(), members);
    }

    /// The documented end-to-end timing: items at t=0/5/10s with idle=30s and
    /// window=90s close at t=40s with 3 members, not at t=90s.
    #[tokio::test]
    async fn idle_close_beats_window_cap() {
        let f = fixture(Duration::from_secs(90), Duration::from_secs(30));

        f.aggregator.offer(&record("cam1", "person", 0.5)).await.unwrap();
        f.clock.advance(Duration::from_secs(5));
        f.aggregator.offer(&record("cam1", "person", 0.5)).await.unwrap();
        f.clock.advance(Duration::from_secs(5));
        f.aggregator.offer(&record("cam1", "person", 0.5)).await.unwrap();

        // t=10s .. t=39s: still open.
        f.clock.advance(Duration::from_secs(29));
        assert_eq!(f.aggregator.sweep_once().await, 0);

        // t=40s: idle deadline (last activity at t=10s) fires.
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.aggregator.sweep_once().await, 1);

        let batch = f.downstream.try_dequeue().expect("batch emitted");
        assert_eq!(batch.member_ids.len(), 3);
    }

    /// Appending keeps arrival order in member_ids.
    #[tokio::test]
    async fn member_order_preserves_arrival() {
        let f = fixture(Duration::from_secs(90), Duration::from_secs(30));

        let first = record("cam1", "person", 0.5);
        let second = record("cam1", "vehicle", 0.6);
        f.aggregator.offer(&first).await.unwrap();
        f.aggregator.offer(&second).await.unwrap();

        f.clock.advance(Duration::from_secs(30));
        f.aggregator.sweep_once().await;

        let batch = f.downstream.try_dequeue().unwrap();
        assert_eq!(batch.member_ids, vec![first.id, second.id]);
    }

    /// A fast-path item becomes a singleton batch and leaves the open batch
    /// for the same source untouched.
    #[tokio::test]
    async fn fast_path_does_not_disturb_open_batch() {
        let f = fixture(Duration::from_secs(90), Duration::from_secs(30));

        f.aggregator.offer(&record("cam1", "person", 0.5)).await.unwrap();
        f.clock.advance(Duration::from_secs(10));
        f.aggregator.offer(&record("cam1", "weapon", 0.97)).await.unwrap();

        // The singleton shipped immediately.
        let singleton = f.downstream.try_dequeue().expect("fast-path singleton");
        assert_eq!(singleton.member_ids.len(), 1);

        // The normal batch is still open with one member and its original
        // deadline: the fast-path item neither appended nor bumped activity.
        assert_eq!(f.aggregator.open_batches(), 1);
        f.clock.advance(Duration::from_secs(20));
        assert_eq!(f.aggregator.sweep_once().await, 1, "idle deadline unchanged");
        let normal = f.downstream.try_dequeue().unwrap();
        assert_eq!(normal.member_ids.len(), 1);
    }

    /// Low-confidence detections of critical classes do not take the fast
    /// path.
    #[tokio::test]
    async fn fast_path_requires_confidence() {
        let f = fixture(Duration::from_secs(90), Duration::from_secs(30));
        f.aggregator.offer(&record("cam1", "weapon", 0.5)).await.unwrap();
        assert!(f.downstream.try_dequeue().is_none());
        assert_eq!(f.aggregator.open_batches(), 1);
    }

    /// An item arriving after closure starts a fresh batch.
    #[tokio::test]
    async fn closure_enables_fresh_batch() {
        let f = fixture(Duration::from_secs(90), Duration::from_secs(30));

        f.aggregator.offer(&record("cam1", "person", 0.5)).await.unwrap();
        f.clock.advance(Duration::from_secs(30));
        assert_eq!(f.aggregator.sweep_once().await, 1);

        f.aggregator.offer(&record("cam1", "person", 0.5)).await.unwrap();
        assert_eq!(f.aggregator.open_batches(), 1);

        let first = f.downstream.try_dequeue().unwrap();
        f.clock.advance(Duration::from_secs(30));
        f.aggregator.sweep_once().await;
        let second = f.downstream.try_dequeue().unwrap();
        assert_ne!(first.batch_id, second.batch_id);
    }

    /// Orphaned snapshots from a previous run are re-emitted, not discarded.
    #[tokio::test]
    async fn recover_orphans_emits_stored_batches() {
        let f = fixture(Duration::from_secs(90), Duration::from_secs(30));

        let snapshot = OpenBatchSnapshot {
            batch_id: "orphan-1".to_string(),
            source_id: "cam9".to_string(),
            member_ids: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            started_at: Utc::now(),
            last_activity_at: Utc::now(),
        };
        f.store.put(&snapshot, Duration::from_secs(180)).await.unwrap();

        let recovered = f.aggregator.recover_orphans().await.unwrap();
        assert_eq!(recovered, 1);

        let batch = f.downstream.try_dequeue().expect("orphan re-emitted");
        assert_eq!(batch.batch_id, "orphan-1");
        assert_eq!(batch.member_ids.len(), 3);
        assert!(f.store.entries.is_empty());
    }

    /// Batches for different sources close independently.
    #[tokio::test]
    async fn sources_are_independent() {
        let f = fixture(Duration::from_secs(90), Duration::from_secs(30));

        f.aggregator.offer(&record("cam1", "person", 0.5)).await.unwrap();
        f.clock.advance(Duration::from_secs(20));
        f.aggregator.offer(&record("cam2", "person", 0.5)).await.unwrap();

        f.clock.advance(Duration::from_secs(10));
        assert_eq!(f.aggregator.sweep_once().await, 1, "only cam1 is idle-expired");

        let batch = f.downstream.try_dequeue().unwrap();
        assert_eq!(batch.source_id, "cam1");
        assert_eq!(f.aggregator.open_batches(), 1);
    }
}
