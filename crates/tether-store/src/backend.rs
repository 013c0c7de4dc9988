//! Store gateway contract.
//!
//! Everything the session layer needs from a persistent store: string
//! get/set-with-TTL/delete, list append and destructive drain, set updates
//! for the room indices, and pub/sub. Implemented by [`crate::RedisStore`]
//! for production and [`crate::MemoryStore`] for tests and single-process
//! embedding.

use crate::error::StoreResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Abstract persistent store used by every typed store in this crate.
///
/// All methods are suspension points; implementations must be safe to call
/// concurrently from many tasks.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Read a string value; absence is a normal outcome, not an error
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a string value, optionally with a TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Reset the TTL of an existing key, returning whether it existed
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Append to the tail of a list, optionally trimming to the newest
    /// `max_len` entries and refreshing the list's TTL, in one batched call
    async fn list_append(
        &self,
        key: &str,
        value: &str,
        max_len: Option<usize>,
        ttl: Option<Duration>,
    ) -> StoreResult<()>;

    /// Atomically read the full list in insertion order and delete it
    async fn list_drain(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Current length of a list
    async fn list_len(&self, key: &str) -> StoreResult<usize>;

    /// Apply set additions and removals as one batched request.
    ///
    /// Each pair is `(key, member)`. Batching both directions of a two-sided
    /// index into a single call is what keeps the indices from diverging
    /// when one side's write fails.
    async fn set_update(
        &self,
        add: &[(String, String)],
        remove: &[(String, String)],
    ) -> StoreResult<()>;

    /// Read all members of a set
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Publish a payload to a channel, returning the number of subscribers
    /// it reached. Fire-and-forget: no persistence, no delivery guarantee.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize>;

    /// Subscribe to a channel. The subscription stays active until dropped.
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    /// Verify the backing store is reachable
    async fn health_check(&self) -> StoreResult<()>;
}

/// An active pub/sub subscription.
///
/// Messages published to the channel after the subscription was established
/// arrive in publish order. Dropping the subscription releases the channel;
/// for the Redis backend this also unsubscribes at the store level once the
/// last local subscription for the channel is gone.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(
        channel: String,
        rx: mpsc::UnboundedReceiver<String>,
        on_drop: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            channel,
            rx,
            on_drop,
        }
    }

    /// Channel this subscription listens on
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next payload; `None` once the backend drops the channel
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Non-blocking receive for callers polling from a select loop
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Close the receiver first so the release hook observes a closed
        // sender and can prune this subscription from the channel registry.
        self.rx.close();
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
