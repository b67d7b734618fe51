//! Concurrent collections used by the pipeline stages.

pub mod bounded_queue;

pub use bounded_queue::{
    BoundedQueue, BoundedQueueBuilder, EnqueueError, EnqueueOutcome, OverflowPolicy, OverflowSink,
    QueueConfigError, QueueMetrics, PRESSURE_WARN_RATIO,
};
