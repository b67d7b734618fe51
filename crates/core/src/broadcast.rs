//! Fan-out of pipeline results to live subscribers, with degraded-mode
//! handling when the distribution backend fails.
//!
//! The broadcaster listens on the internal distribution channel through a
//! dedicated circuit breaker and fans every received message out to the
//! subscriber set. One slow or dead subscriber is disconnected and the rest
//! keep receiving; fan-out never blocks on a single connection. When the
//! subscription cannot be re-established within the configured attempt
//! budget and the breaker stops permitting calls, the broadcaster enters
//! degraded mode: subscribers get one explicit degraded-status message, new
//! subscribers are still accepted, and the tight reconnect loop stops. Once
//! the breaker's recovery timeout admits a probe that succeeds, degraded
//! mode clears and a recovered message goes out.
//!
//! A supervision task periodically verifies the listener task is actually
//! alive (not merely that the breaker is closed) and restarts it if it died
//! silently, recording that restart as a breaker failure like any other
//! call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use sentinel_common::{CircuitBreaker, CircuitState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sentinel_domain::{BroadcastConfig, BroadcastMessage};

use crate::ports::{DistributionChannel, DistributionStream};

/// Identifier handed out on connect.
pub type SubscriberId = Uuid;

struct Shared {
    subscribers: DashMap<SubscriberId, mpsc::Sender<BroadcastMessage>>,
    degraded: AtomicBool,
    breaker: Arc<CircuitBreaker>,
    channel: Arc<dyn DistributionChannel>,
    config: BroadcastConfig,
}

impl Shared {
    /// Deliver one message to every subscriber, pruning the ones that are
    /// gone or too far behind. Never blocks on a slow subscriber: a full
    /// buffer counts as a send failure.
    fn fan_out(&self, message: &BroadcastMessage) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().try_send(message.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
            warn!(subscriber = %id, "removed unresponsive subscriber");
        }
    }

    fn enter_degraded(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(reason, "broadcast entering degraded mode");
            self.fan_out(&BroadcastMessage::degraded(reason));
        }
    }

    fn exit_degraded(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!("broadcast recovered from degraded mode");
            self.fan_out(&BroadcastMessage::recovered());
        }
    }
}

/// Fans out pipeline results to live dashboard subscribers.
pub struct Broadcaster {
    shared: Arc<Shared>,
    listener: Arc<Mutex<Option<JoinHandle<()>>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    /// Create a broadcaster over the given distribution channel and its
    /// dedicated breaker.
    pub fn new(
        channel: Arc<dyn DistributionChannel>,
        breaker: Arc<CircuitBreaker>,
        config: BroadcastConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: DashMap::new(),
                degraded: AtomicBool::new(false),
                breaker,
                channel,
                config,
            }),
            listener: Arc::new(Mutex::new(None)),
            supervisor: Mutex::new(None),
        }
    }

    /// Register a subscriber; returns its id and the receiving end.
    ///
    /// Works in degraded mode too: subscribers connected while the
    /// distribution backend is down start receiving again on recovery.
    pub fn connect(&self) -> (SubscriberId, mpsc::Receiver<BroadcastMessage>) {
        let (tx, rx) = mpsc::channel(self.shared.config.subscriber_buffer);
        let id = Uuid::new_v4();
        self.shared.subscribers.insert(id, tx);
        debug!(subscriber = %id, "subscriber connected");
        (id, rx)
    }

    /// Remove a subscriber.
    pub fn disconnect(&self, id: SubscriberId) {
        if self.shared.subscribers.remove(&id).is_some() {
            debug!(subscriber = %id, "subscriber disconnected");
        }
    }

    /// Current number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Deliver a message to every current subscriber.
    pub fn publish(&self, message: &BroadcastMessage) {
        self.shared.fan_out(message);
    }

    /// True while real-time distribution is suspended.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::SeqCst)
    }

    /// Spawn the distribution listener and its supervisor.
    pub fn start(&self, cancel: CancellationToken) {
        let mut listener_slot = self.listener.lock();
        if listener_slot.is_some() {
            return;
        }
        *listener_slot = Some(tokio::spawn(Self::run_listener(
            Arc::clone(&self.shared),
            cancel.clone(),
        )));
        drop(listener_slot);

        let mut supervisor_slot = self.supervisor.lock();
        *supervisor_slot = Some(tokio::spawn(Self::run_supervisor(
            Arc::clone(&self.shared),
            Arc::clone(&self.listener),
            cancel,
        )));
    }

    /// Await termination of the listener and supervisor tasks. Call after
    /// cancelling the token passed to [`Broadcaster::start`].
    pub async fn stop(&self) {
        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            let _ = handle.await;
        }
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
    }

    /// Listener loop: subscribe to the distribution channel through the
    /// breaker and fan out everything received.
    async fn run_listener(shared: Arc<Shared>, cancel: CancellationToken) {
        let mut failed_attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            if !shared.breaker.is_call_permitted() {
                // Breaker is open: stop hammering the backend. After the
                // configured attempt budget this is where degraded mode
                // begins; the breaker's recovery timeout schedules the next
                // probe.
                if failed_attempts >= shared.config.reconnect_max_attempts {
                    shared.enter_degraded("distribution channel unavailable");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
                }
                continue;
            }

            match shared.channel.subscribe().await {
                Ok(mut stream) => {
                    shared.breaker.record_success();
                    failed_attempts = 0;
                    if shared.breaker.state() == CircuitState::Closed {
                        shared.exit_degraded();
                    }
                    debug!("distribution subscription established");

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            next = stream.next() => match next {
                                Ok(Some(message)) => shared.fan_out(&message),
                                Ok(None) => {
                                    warn!("distribution stream ended");
                                    shared.breaker.record_failure();
                                    failed_attempts += 1;
                                    break;
                                }
                                Err(err) => {
                                    warn!(error = %err, "distribution stream failed");
                                    shared.breaker.record_failure();
                                    failed_attempts += 1;
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "distribution subscription failed");
                    shared.breaker.record_failure();
                    failed_attempts += 1;
                    if failed_attempts >= shared.config.reconnect_max_attempts
                        && !shared.breaker.is_call_permitted()
                    {
                        shared.enter_degraded("distribution channel unavailable");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
                    }
                }
            }
        }
    }

    /// Supervisor loop: restart a silently-dead listener and double-check
    /// degraded-mode recovery against the breaker state.
    async fn run_supervisor(
        shared: Arc<Shared>,
        listener: Arc<Mutex<Option<JoinHandle<()>>>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(shared.config.supervise_interval) => {}
            }
            if cancel.is_cancelled() {
                break;
            }

            let needs_restart = {
                let slot = listener.lock();
                slot.as_ref().is_some_and(JoinHandle::is_finished)
            };
            if needs_restart {
                warn!("distribution listener died silently; restarting");
                // The silent death counts against the dependency like any
                // failed call; the restarted listener records the success.
                shared.breaker.record_failure();
                let handle =
                    tokio::spawn(Self::run_listener(Arc::clone(&shared), cancel.clone()));
                *listener.lock() = Some(handle);
            }

            // Belt-and-braces: if the listener already closed the breaker but
            // the degraded flag is stale, clear it here.
            if shared.degraded.load(Ordering::SeqCst)
                && shared.breaker.state() == CircuitState::Closed
            {
                shared.exit_degraded();
            }
        }
    }
}
