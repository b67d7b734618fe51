//! Pipeline runtime: wiring, startup, and supervised shutdown.
//!
//! Owns the queues, the aggregator and its sweep task, both worker pools,
//! the broadcaster, and the breaker registry. `start()` recovers orphaned
//! batch state before any worker runs; `stop()` cancels every task, closes
//! the queues so workers drain, and joins with a bounded timeout.

use std::sync::Arc;

use parking_lot::Mutex;
use sentinel_common::{
    BoundedQueue, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, EnqueueError,
    EnqueueOutcome, OverflowPolicy, RetryConfig,
};
use sentinel_domain::{
    BreakerSettings, DetectionBatch, HealthSnapshot, IngestJob, PipelineConfig, QueueOverflow,
    Result, RetrySettings, SentinelError,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::aggregator::BatchAggregator;
use crate::broadcast::Broadcaster;
use crate::dlq::{DeadLetterOverflowSink, DeadLetterService, OriginQueues};
use crate::health::HealthService;
use crate::pipeline::{AnalysisStage, DetectionStage};
use crate::ports::{
    AnalysisClient, BatchStateStore, DeadLetterStore, DetectionClient, DistributionChannel,
    EventStore,
};

/// External collaborators injected into the runtime.
pub struct PipelineDeps {
    pub detection: Arc<dyn DetectionClient>,
    pub analysis: Arc<dyn AnalysisClient>,
    pub events: Arc<dyn EventStore>,
    pub batch_state: Arc<dyn BatchStateStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub distribution: Arc<dyn DistributionChannel>,
}

/// The assembled pipeline with explicit lifecycle management.
pub struct PipelineRuntime {
    config: PipelineConfig,
    ingest_queue: BoundedQueue<IngestJob>,
    analysis_queue: BoundedQueue<DetectionBatch>,
    aggregator: Arc<BatchAggregator>,
    detection_stage: Arc<DetectionStage>,
    analysis_stage: Arc<AnalysisStage>,
    broadcaster: Arc<Broadcaster>,
    dlq: Arc<DeadLetterService>,
    registry: Arc<CircuitBreakerRegistry>,
    health: Arc<HealthService>,
    cancellation: Mutex<CancellationToken>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineRuntime {
    /// Validate the configuration and wire every component.
    pub fn new(config: PipelineConfig, deps: PipelineDeps) -> Result<Self> {
        config.validate()?;

        let sink = Arc::new(DeadLetterOverflowSink::new(Arc::clone(&deps.dead_letters)));
        let policy = map_overflow(config.queues.overflow);

        let ingest_queue: BoundedQueue<IngestJob> =
            BoundedQueue::builder("ingest", config.queues.ingest_capacity)
                .policy(policy)
                .overflow_sink(sink.clone())
                .build()
                .map_err(|err| SentinelError::Config(err.to_string()))?;
        let analysis_queue: BoundedQueue<DetectionBatch> =
            BoundedQueue::builder("analysis", config.queues.analysis_capacity)
                .policy(policy)
                .overflow_sink(sink)
                .build()
                .map_err(|err| SentinelError::Config(err.to_string()))?;

        let registry = Arc::new(CircuitBreakerRegistry::new());
        let detection_breaker = register(&registry, "detection", &config.detection_breaker)?;
        let analysis_breaker = register(&registry, "analysis", &config.analysis_breaker)?;
        let distribution_breaker =
            register(&registry, "distribution", &config.distribution_breaker)?;

        let dlq = Arc::new(DeadLetterService::new(
            Arc::clone(&deps.dead_letters),
            OriginQueues { ingest: ingest_queue.clone(), analysis: analysis_queue.clone() },
        ));

        let aggregator = Arc::new(BatchAggregator::new(
            config.aggregator.clone(),
            analysis_queue.clone(),
            Arc::clone(&deps.batch_state),
        ));

        let detection_stage = Arc::new(DetectionStage::new(
            ingest_queue.clone(),
            Arc::clone(&deps.detection),
            Arc::clone(&deps.events),
            Arc::clone(&aggregator),
            detection_breaker,
            map_retry(&config.detection_retry)?,
            Arc::clone(&dlq),
            config.workers.dequeue_timeout,
        ));

        let analysis_stage = Arc::new(AnalysisStage::new(
            analysis_queue.clone(),
            Arc::clone(&deps.analysis),
            Arc::clone(&deps.events),
            Arc::clone(&deps.distribution),
            analysis_breaker,
            map_retry(&config.analysis_retry)?,
            Arc::clone(&dlq),
            config.workers.dequeue_timeout,
        ));

        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&deps.distribution),
            distribution_breaker,
            config.broadcast.clone(),
        ));

        let health = Arc::new(HealthService::new(
            ingest_queue.clone(),
            analysis_queue.clone(),
            Arc::clone(&dlq),
            Arc::clone(&registry),
            Arc::clone(&broadcaster),
        ));

        Ok(Self {
            config,
            ingest_queue,
            analysis_queue,
            aggregator,
            detection_stage,
            analysis_stage,
            broadcaster,
            dlq,
            registry,
            health,
            cancellation: Mutex::new(CancellationToken::new()),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Producer boundary: submit a job to the ingest queue.
    ///
    /// A `Rejected` outcome under the reject policy is the backpressure
    /// signal; the producer decides whether to drop, wait, or escalate.
    pub async fn submit(
        &self,
        job: IngestJob,
    ) -> std::result::Result<EnqueueOutcome, EnqueueError<IngestJob>> {
        self.ingest_queue.enqueue(job).await
    }

    /// Recover orphaned state and spawn every pipeline task.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        {
            let handles = self.handles.lock();
            if !handles.is_empty() {
                return Err(SentinelError::Internal("pipeline already running".into()));
            }
        }

        let recovered = self.aggregator.recover_orphans().await?;
        if recovered > 0 {
            info!(recovered, "re-emitted orphaned batches from a previous run");
        }

        let cancel = CancellationToken::new();
        *self.cancellation.lock() = cancel.clone();

        let mut handles = Vec::new();
        for worker_id in 0..self.config.workers.detection_workers {
            handles.push(tokio::spawn(
                Arc::clone(&self.detection_stage).run_worker(worker_id, cancel.clone()),
            ));
        }
        for worker_id in 0..self.config.workers.analysis_workers {
            handles.push(tokio::spawn(
                Arc::clone(&self.analysis_stage).run_worker(worker_id, cancel.clone()),
            ));
        }
        handles.push(tokio::spawn(Arc::clone(&self.aggregator).run_sweeper(cancel.clone())));
        self.broadcaster.start(cancel);

        *self.handles.lock() = handles;
        info!(
            detection_workers = self.config.workers.detection_workers,
            analysis_workers = self.config.workers.analysis_workers,
            "pipeline started"
        );
        Ok(())
    }

    /// Cancel every task, close the queues, and join with a timeout.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return Err(SentinelError::Internal("pipeline not running".into()));
        }

        self.cancellation.lock().cancel();
        self.ingest_queue.close();
        self.analysis_queue.close();

        let join_timeout = self.config.workers.join_timeout;
        for handle in handles {
            match tokio::time::timeout(join_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "pipeline task panicked"),
                Err(_) => warn!("pipeline task did not stop within the join timeout"),
            }
        }
        self.broadcaster.stop().await;
        info!("pipeline stopped");
        Ok(())
    }

    /// True while pipeline tasks are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    /// Current pipeline health.
    pub async fn health(&self) -> Result<HealthSnapshot> {
        self.health.snapshot().await
    }

    /// The DLQ management interface.
    #[must_use]
    pub fn dead_letters(&self) -> Arc<DeadLetterService> {
        Arc::clone(&self.dlq)
    }

    /// The broadcaster, for subscriber connections.
    #[must_use]
    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        Arc::clone(&self.broadcaster)
    }

    /// The breaker registry, for direct inspection.
    #[must_use]
    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.registry)
    }
}

impl Drop for PipelineRuntime {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("pipeline runtime dropped while running; cancelling tasks");
            self.cancellation.lock().cancel();
            self.ingest_queue.close();
            self.analysis_queue.close();
        }
    }
}

fn map_overflow(overflow: QueueOverflow) -> OverflowPolicy {
    match overflow {
        QueueOverflow::Reject => OverflowPolicy::Reject,
        QueueOverflow::DeadLetter => OverflowPolicy::DeadLetter,
        QueueOverflow::DropOldest => OverflowPolicy::DropOldest,
    }
}

fn map_retry(settings: &RetrySettings) -> Result<RetryConfig> {
    RetryConfig::builder()
        .max_retries(settings.max_retries)
        .base_delay(settings.base_delay)
        .max_delay(settings.max_delay)
        .exponential_base(settings.exponential_base)
        .jitter(settings.jitter)
        .build()
        .map_err(|err| SentinelError::Config(err.to_string()))
}

fn register(
    registry: &Arc<CircuitBreakerRegistry>,
    name: &str,
    settings: &BreakerSettings,
) -> Result<Arc<CircuitBreaker>> {
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(settings.failure_threshold)
        .success_threshold(settings.success_threshold)
        .recovery_timeout(settings.recovery_timeout)
        .half_open_max_calls(settings.half_open_max_calls)
        .build()
        .map_err(|err| SentinelError::Config(err.to_string()))?;
    registry.register(name, config).map_err(|err| SentinelError::Config(err.to_string()))
}
