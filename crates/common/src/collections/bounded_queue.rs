//! Bounded FIFO work queue with configurable overflow policies.
//!
//! This module implements [`BoundedQueue`], the foundational primitive that
//! every pipeline stage consumes from.
//!
//! **Complexity**
//! - `enqueue`, `try_dequeue`, and `dequeue` complete in `O(1)` plus the cost
//!   of evicting under the dead-letter policy (`O(k)` for `k` evicted items).
//!
//! **Overflow behavior**
//! - The queue never grows past its capacity. When full, `enqueue` applies
//!   the configured [`OverflowPolicy`]: reject the new item, move the oldest
//!   item(s) to a dead-letter sink, or (legacy) drop the oldest silently.
//!
//! **Thread Safety**
//! - All operations take `&self` and may be invoked concurrently by multiple
//!   producers and consumers; the queue is cheaply cloneable and clones share
//!   the same underlying state.
//! - Consumers park on a `tokio::sync::Notify`; `dequeue` suspends for at
//!   most the supplied timeout, then reports empty. A timeout is the queue's
//!   idle signal, not an error.
//!
//! **Semantics of `close()`**
//! - Closing prevents new enqueues and wakes all waiting consumers.
//! - Pending dequeues drain any buffered items before yielding empty.
//! - The operation is idempotent; repeated calls have no additional effect.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

/// Fill ratio above which callers should raise operational alerts.
///
/// This is a reporting threshold only; it never gates queue behavior.
pub const PRESSURE_WARN_RATIO: f64 = 0.8;

/// Policy applied when an item is enqueued into a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the new item; the producer must handle the rejection.
    Reject,
    /// Move the oldest item(s) to the configured dead-letter sink to make
    /// room, then accept the new item. Trades old data for new.
    DeadLetter,
    /// Discard the oldest item(s) without preservation. Legacy behavior,
    /// retained for backward compatibility and logged as a warning.
    DropOldest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::Reject => f.write_str("reject"),
            OverflowPolicy::DeadLetter => f.write_str("dead_letter"),
            OverflowPolicy::DropOldest => f.write_str("drop_oldest"),
        }
    }
}

/// Destination for items evicted under [`OverflowPolicy::DeadLetter`].
///
/// Implementations must not fail the eviction path; errors are handled (and
/// logged) inside the sink.
#[async_trait]
pub trait OverflowSink<T>: Send + Sync {
    /// Absorb items evicted from the named queue.
    async fn absorb(&self, items: Vec<T>, source_queue: &str);
}

/// Successful enqueue outcomes the caller may want to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The item was accepted without displacing anything.
    Accepted,
    /// The item was accepted after moving this many older items to the
    /// dead-letter sink.
    MovedToDeadLetter(usize),
    /// The item was accepted after discarding this many older items.
    DroppedOldest(usize),
}

/// Error returned by [`BoundedQueue::enqueue`] when the item cannot be
/// admitted. The item is handed back to the caller in both variants.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError<T> {
    /// The queue was full under the reject policy.
    Rejected(T),
    /// The queue has been closed.
    Closed(T),
}

impl<T> EnqueueError<T> {
    /// Returns the item that failed to be enqueued.
    #[must_use]
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::Rejected(item) | EnqueueError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Rejected(_) => f.write_str("bounded queue is full"),
            EnqueueError::Closed(_) => f.write_str("bounded queue is closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for EnqueueError<T> {}

/// Error raised when a queue is constructed with an invalid configuration.
#[derive(Debug, thiserror::Error)]
pub enum QueueConfigError {
    /// Capacity must be non-zero.
    #[error("queue capacity must be greater than 0")]
    ZeroCapacity,
    /// The dead-letter policy requires a sink to evict into.
    #[error("dead-letter overflow policy requires an overflow sink")]
    MissingSink,
}

/// Point-in-time view of a queue for health reporting.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    /// Queue name as given at construction.
    pub name: String,
    /// Current element count.
    pub len: usize,
    /// Maximum element count.
    pub capacity: usize,
    /// `len / capacity`.
    pub fill_ratio: f64,
    /// Total items accepted since construction.
    pub enqueued: u64,
    /// Total items refused under the reject policy.
    pub rejected: u64,
    /// Total items moved to the dead-letter sink by overflow.
    pub dead_lettered: u64,
    /// Total items discarded under the legacy drop-oldest policy.
    pub dropped: u64,
}

impl QueueMetrics {
    /// True when the fill ratio crossed the alerting threshold.
    #[must_use]
    pub fn under_pressure(&self) -> bool {
        self.fill_ratio > PRESSURE_WARN_RATIO
    }
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
}

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

struct State<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Notify,
    name: String,
    capacity: usize,
    policy: OverflowPolicy,
    sink: Option<Arc<dyn OverflowSink<T>>>,
    counters: Counters,
}

/// Builder for [`BoundedQueue`] with validation.
pub struct BoundedQueueBuilder<T> {
    name: String,
    capacity: usize,
    policy: OverflowPolicy,
    sink: Option<Arc<dyn OverflowSink<T>>>,
}

impl<T> BoundedQueueBuilder<T> {
    /// Set the overflow policy (default: [`OverflowPolicy::Reject`]).
    #[must_use]
    pub fn policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the sink that receives items evicted under the dead-letter
    /// policy.
    #[must_use]
    pub fn overflow_sink(mut self, sink: Arc<dyn OverflowSink<T>>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate and build the queue.
    pub fn build(self) -> Result<BoundedQueue<T>, QueueConfigError> {
        if self.capacity == 0 {
            return Err(QueueConfigError::ZeroCapacity);
        }
        if self.policy == OverflowPolicy::DeadLetter && self.sink.is_none() {
            return Err(QueueConfigError::MissingSink);
        }
        Ok(BoundedQueue {
            state: Arc::new(State {
                inner: Mutex::new(Inner { queue: VecDeque::with_capacity(self.capacity), closed: false }),
                not_empty: Notify::new(),
                name: self.name,
                capacity: self.capacity,
                policy: self.policy,
                sink: self.sink,
                counters: Counters::default(),
            }),
        })
    }
}

/// Bounded FIFO work queue shared between pipeline stages.
///
/// See the module documentation for the overflow and close semantics.
pub struct BoundedQueue<T> {
    state: Arc<State<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self { state: Arc::clone(&self.state) }
    }
}

impl<T: Send + 'static> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("name", &self.state.name)
            .field("len", &self.len())
            .field("capacity", &self.state.capacity)
            .field("policy", &self.state.policy)
            .finish()
    }
}

impl<T: Send + 'static> BoundedQueue<T> {
    /// Creates a queue with the reject policy and no sink.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero. Use [`BoundedQueue::builder`] for
    /// fallible construction.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self::builder(name, capacity).build().expect("non-zero capacity with reject policy")
    }

    /// Start building a queue with the given name and capacity.
    #[must_use]
    pub fn builder(name: impl Into<String>, capacity: usize) -> BoundedQueueBuilder<T> {
        BoundedQueueBuilder {
            name: name.into(),
            capacity,
            policy: OverflowPolicy::Reject,
            sink: None,
        }
    }

    /// Queue name as given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Returns the maximum number of elements that can be stored.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    /// Returns the current element count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.inner.lock().queue.len()
    }

    /// Returns `true` when the queue has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` when the queue is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.state.capacity
    }

    /// Current fill ratio in `[0.0, 1.0]`.
    #[must_use]
    pub fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.state.capacity as f64
    }

    /// True when the fill ratio crossed [`PRESSURE_WARN_RATIO`].
    #[must_use]
    pub fn is_under_pressure(&self) -> bool {
        self.fill_ratio() > PRESSURE_WARN_RATIO
    }

    /// Marks the queue as closed and wakes all waiting consumers.
    pub fn close(&self) {
        {
            let mut inner = self.state.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.state.not_empty.notify_waiters();
    }

    /// Returns `true` if [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.inner.lock().closed
    }

    /// Snapshot the queue counters for health reporting.
    #[must_use]
    pub fn metrics(&self) -> QueueMetrics {
        let len = self.len();
        QueueMetrics {
            name: self.state.name.clone(),
            len,
            capacity: self.state.capacity,
            fill_ratio: len as f64 / self.state.capacity as f64,
            enqueued: self.state.counters.enqueued.load(Ordering::Relaxed),
            rejected: self.state.counters.rejected.load(Ordering::Relaxed),
            dead_lettered: self.state.counters.dead_lettered.load(Ordering::Relaxed),
            dropped: self.state.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Enqueue an element, applying the overflow policy when full.
    ///
    /// Never suspends waiting for capacity: the decision is made immediately
    /// against the configured policy. Under the dead-letter policy the
    /// evicted items are handed to the sink before this call returns.
    pub async fn enqueue(&self, item: T) -> Result<EnqueueOutcome, EnqueueError<T>> {
        let (outcome, evicted) = {
            let mut inner = self.state.inner.lock();
            if inner.closed {
                return Err(EnqueueError::Closed(item));
            }
            if inner.queue.len() < self.state.capacity {
                inner.queue.push_back(item);
                (EnqueueOutcome::Accepted, None)
            } else {
                let excess = inner.queue.len() - self.state.capacity + 1;
                match self.state.policy {
                    OverflowPolicy::Reject => {
                        self.state.counters.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(EnqueueError::Rejected(item));
                    }
                    OverflowPolicy::DeadLetter => {
                        let mut evicted = Vec::with_capacity(excess);
                        for _ in 0..excess {
                            if let Some(old) = inner.queue.pop_front() {
                                evicted.push(old);
                            }
                        }
                        inner.queue.push_back(item);
                        let count = evicted.len();
                        self.state
                            .counters
                            .dead_lettered
                            .fetch_add(count as u64, Ordering::Relaxed);
                        (EnqueueOutcome::MovedToDeadLetter(count), Some(evicted))
                    }
                    OverflowPolicy::DropOldest => {
                        for _ in 0..excess {
                            inner.queue.pop_front();
                        }
                        inner.queue.push_back(item);
                        self.state.counters.dropped.fetch_add(excess as u64, Ordering::Relaxed);
                        (EnqueueOutcome::DroppedOldest(excess), None)
                    }
                }
            }
        };

        if let EnqueueOutcome::DroppedOldest(count) = outcome {
            warn!(
                queue = %self.state.name,
                dropped = count,
                "drop-oldest overflow discarded items without preservation"
            );
        }

        self.state.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.state.not_empty.notify_waiters();

        if let Some(items) = evicted {
            if let Some(sink) = &self.state.sink {
                sink.absorb(items, &self.state.name).await;
            }
        }

        Ok(outcome)
    }

    /// Attempts to dequeue an element without suspending.
    #[must_use]
    pub fn try_dequeue(&self) -> Option<T> {
        self.state.inner.lock().queue.pop_front()
    }

    /// Dequeue an element, suspending for at most `timeout`.
    ///
    /// Returns `None` when the timeout elapses with the queue empty, or when
    /// the queue is closed and drained. FIFO order is preserved across
    /// concurrent consumers: each call removes the current head.
    pub async fn dequeue(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.state.not_empty.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking so an enqueue between the
            // check and the await is never missed.
            notified.as_mut().enable();
            {
                let mut inner = self.state.inner.lock();
                if let Some(item) = inner.queue.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_dequeue();
            }
        }
    }
}
