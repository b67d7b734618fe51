//! In-process distribution channel over `tokio::sync::broadcast`.
//!
//! Messages published while no subscription exists are dropped, matching
//! broadcast-channel semantics; the Broadcaster holds a subscription for the
//! lifetime of the pipeline, so in practice only pre-startup messages are
//! affected. A lagged subscription skips the overwritten messages and keeps
//! going rather than failing the stream.

use async_trait::async_trait;
use sentinel_core::ports::{DistributionChannel, DistributionStream};
use sentinel_domain::{BroadcastMessage, Result};
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 256;

/// In-process [`DistributionChannel`].
pub struct LocalDistributionChannel {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl LocalDistributionChannel {
    /// Create a channel with the default buffer capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a channel buffering up to `capacity` undelivered messages per
    /// subscription.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for LocalDistributionChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributionChannel for LocalDistributionChannel {
    async fn publish(&self, message: &BroadcastMessage) -> Result<()> {
        // A send error only means no live subscriptions; not a failure.
        let _ = self.tx.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn DistributionStream>> {
        Ok(Box::new(LocalStream { rx: self.tx.subscribe() }))
    }
}

struct LocalStream {
    rx: broadcast::Receiver<BroadcastMessage>,
}

#[async_trait]
impl DistributionStream for LocalStream {
    async fn next(&mut self) -> Result<Option<BroadcastMessage>> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Ok(Some(message)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "distribution subscription lagged; skipping messages");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use sentinel_domain::BroadcastEvent;

    use super::*;

    #[tokio::test]
    async fn published_messages_reach_subscription() {
        let channel = LocalDistributionChannel::new();
        let mut stream = channel.subscribe().await.unwrap();

        channel.publish(&BroadcastMessage::status("one")).await.unwrap();
        channel.publish(&BroadcastMessage::status("two")).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        match first.event {
            BroadcastEvent::Status { message } => assert_eq!(message, "one"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(stream.next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let channel = LocalDistributionChannel::new();
        channel.publish(&BroadcastMessage::status("dropped")).await.unwrap();
    }

    #[tokio::test]
    async fn independent_subscriptions_each_receive() {
        let channel = LocalDistributionChannel::new();
        let mut a = channel.subscribe().await.unwrap();
        let mut b = channel.subscribe().await.unwrap();

        channel.publish(&BroadcastMessage::status("fanout")).await.unwrap();

        assert!(a.next().await.unwrap().is_some());
        assert!(b.next().await.unwrap().is_some());
    }
}
