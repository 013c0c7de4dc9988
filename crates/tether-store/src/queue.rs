//! Per-session message queue and pub/sub channel access.
//!
//! The durable queue is the pull path: envelopes appended here survive until
//! drained, and the queue's TTL is refreshed to the session TTL on every
//! append so queue and session expire together. The channel is the push
//! path: fire-and-forget, no persistence, no delivery guarantee. Together
//! they approximate at-least-once delivery without a persistent socket.

use crate::backend::{StoreBackend, Subscription};
use crate::error::StoreResult;
use crate::keys::{self, Channel};
use std::sync::Arc;
use std::time::Duration;
use tether_core::Envelope;

/// Default cap on queued envelopes per session; oldest entries are trimmed
pub const DEFAULT_MAX_QUEUE_LEN: usize = 1000;

/// Durable per-session message queue
#[derive(Clone)]
pub struct MessageQueue {
    backend: Arc<dyn StoreBackend>,
    ttl: Duration,
    max_len: usize,
}

impl MessageQueue {
    /// Create a message queue with the given TTL and default length cap
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            max_len: DEFAULT_MAX_QUEUE_LEN,
        }
    }

    /// Override the per-session queue length cap
    #[must_use]
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Append an envelope to the session's durable queue.
    ///
    /// Refreshes the queue's TTL so it cannot outlive or underlive the
    /// session by more than one operation's latency.
    pub async fn enqueue(&self, session_id: &str, envelope: &Envelope) -> StoreResult<()> {
        let serialized = envelope.to_json()?;
        self.backend
            .list_append(
                &keys::queue(session_id),
                &serialized,
                Some(self.max_len),
                Some(self.ttl),
            )
            .await
    }

    /// Destructively read the full queue in insertion order.
    ///
    /// Read and clear happen as one atomic store operation; returns an empty
    /// sequence, never an error, if nothing is queued. Entries that fail to
    /// parse are logged and skipped rather than poisoning the whole drain.
    pub async fn drain(&self, session_id: &str) -> StoreResult<Vec<Envelope>> {
        let raw = self.backend.list_drain(&keys::queue(session_id)).await?;

        let mut envelopes = Vec::with_capacity(raw.len());
        for item in raw {
            match Envelope::from_json(&item) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Skipping malformed queued envelope");
                }
            }
        }
        Ok(envelopes)
    }

    /// Number of envelopes currently queued
    pub async fn len(&self, session_id: &str) -> StoreResult<usize> {
        self.backend.list_len(&keys::queue(session_id)).await
    }

    /// Whether the session's queue is empty
    pub async fn is_empty(&self, session_id: &str) -> StoreResult<bool> {
        Ok(self.len(session_id).await? == 0)
    }

    /// Fire-and-forget publish to a channel; returns subscribers reached
    pub async fn publish(&self, channel: &Channel, envelope: &Envelope) -> StoreResult<usize> {
        let serialized = envelope.to_json()?;
        self.backend.publish(&channel.name(), &serialized).await
    }

    /// Subscribe to a channel; active until the subscription is dropped
    pub async fn subscribe(&self, channel: &Channel) -> StoreResult<Subscription> {
        self.backend.subscribe(&channel.name()).await
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("ttl", &self.ttl)
            .field("max_len", &self.max_len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;
    use tokio::time::{advance, Duration};

    fn queue() -> MessageQueue {
        MessageQueue::new(Arc::new(MemoryStore::new()), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_enqueue_drain_preserves_order() {
        let queue = queue();

        for i in 1..=3 {
            let envelope = Envelope::new("chat", json!({ "seq": i }));
            queue.enqueue("s1", &envelope).await.unwrap();
        }

        let drained = queue.drain("s1").await.unwrap();
        assert_eq!(drained.len(), 3);
        for (i, envelope) in drained.iter().enumerate() {
            assert_eq!(envelope.data, json!({ "seq": i + 1 }));
        }

        // Drain is destructive: a second drain returns empty
        assert!(queue.drain("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_empty_queue() {
        let queue = queue();
        assert!(queue.drain("nobody").await.unwrap().is_empty());
        assert!(queue.is_empty("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_cap_trims_oldest() {
        let queue = queue().with_max_len(2);

        for i in 1..=4 {
            let envelope = Envelope::new("chat", json!({ "seq": i }));
            queue.enqueue("s1", &envelope).await.unwrap();
        }

        let drained = queue.drain("s1").await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].data, json!({ "seq": 3 }));
        assert_eq!(drained[1].data, json!({ "seq": 4 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_expires_with_session_ttl() {
        let queue = MessageQueue::new(Arc::new(MemoryStore::new()), Duration::from_secs(10));

        queue
            .enqueue("s1", &Envelope::new("chat", json!({})))
            .await
            .unwrap();

        advance(Duration::from_secs(11)).await;
        assert!(queue.drain("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let queue = queue();
        let channel = Channel::session("s1");

        let mut sub = queue.subscribe(&channel).await.unwrap();
        let envelope = Envelope::new("chat", json!({ "text": "hi" }));
        let delivered = queue.publish(&channel, &envelope).await.unwrap();
        assert_eq!(delivered, 1);

        let raw = sub.recv().await.unwrap();
        let received = Envelope::from_json(&raw).unwrap();
        assert_eq!(received.event, "chat");
        assert_eq!(received.data, json!({ "text": "hi" }));
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_lost() {
        let queue = queue();
        let channel = Channel::session("s1");

        let delivered = queue
            .publish(&channel, &Envelope::new("chat", json!({})))
            .await
            .unwrap();
        assert_eq!(delivered, 0);

        // Nothing lands in the durable queue over the publish path
        assert!(queue.drain("s1").await.unwrap().is_empty());
    }
}
