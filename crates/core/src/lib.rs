//! # Sentinel Core
//!
//! Ports and services of the Sentinel pipeline: the batch aggregator, the
//! detection and analysis worker stages, the dead-letter service, the
//! broadcaster, and the runtime that wires and supervises them. External
//! collaborators (detection/analysis inference, persistence, the
//! distribution backend, the batch-state store) are consumed through the
//! async traits in [`ports`]; adapters live in `sentinel-infra`.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod aggregator;
pub mod broadcast;
pub mod dlq;
pub mod health;
pub mod pipeline;
pub mod ports;
pub mod runtime;

pub use aggregator::BatchAggregator;
pub use broadcast::Broadcaster;
pub use dlq::{DeadLetterOverflowSink, DeadLetterService};
pub use health::HealthService;
pub use pipeline::{AnalysisStage, DetectionStage, TransientClassifier};
pub use runtime::{PipelineDeps, PipelineRuntime};
