//! Acknowledgement tracking
//!
//! Emits that request an ack park a one-shot waiter here under their
//! message ID. The receiving client echoes the ID back in an ack event,
//! which resolves the waiter. Waiters that outlive the ack window are
//! evicted and resolved with a timeout error, so a crashed or silent
//! client can never leak registry entries.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{EngineError, EngineResult};

type AckSender = oneshot::Sender<EngineResult<Value>>;

/// Process-wide registry of emits awaiting acknowledgement.
pub struct AckRegistry {
    pending: Arc<DashMap<String, AckSender>>,
    timeout: Duration,
}

impl AckRegistry {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Register a waiter for `message_id` and arm its timeout.
    ///
    /// The returned handle resolves exactly once: either with the ack
    /// payload or with [`EngineError::AckTimeout`].
    #[must_use]
    pub fn register(&self, message_id: &str) -> AckHandle {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(message_id.to_string(), tx);

        let pending = Arc::clone(&self.pending);
        let timeout = self.timeout;
        let id = message_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, tx)) = pending.remove(&id) {
                tracing::debug!(message_id = %id, "Ack timed out");
                let _ = tx.send(Err(EngineError::AckTimeout { message_id: id.clone() }));
            }
        });

        AckHandle {
            message_id: message_id.to_string(),
            rx,
        }
    }

    /// Resolve a pending waiter with the receiver's payload.
    ///
    /// Returns false when the ID is unknown, already resolved, or timed
    /// out; duplicate acks land here and are dropped silently.
    pub fn resolve(&self, message_id: &str, data: Value) -> bool {
        match self.pending.remove(message_id) {
            Some((_, tx)) => tx.send(Ok(data)).is_ok(),
            None => false,
        }
    }

    /// Number of emits still waiting for an ack.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for AckRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckRegistry")
            .field("pending", &self.pending.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Waiter returned by [`AckRegistry::register`].
pub struct AckHandle {
    message_id: String,
    rx: oneshot::Receiver<EngineResult<Value>>,
}

impl AckHandle {
    /// The message ID this handle is waiting on.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Wait for the ack payload or the timeout, whichever lands first.
    pub async fn wait(self) -> EngineResult<Value> {
        match self.rx.await {
            Ok(result) => result,
            // Sender dropped without resolving; treat like a timeout.
            Err(_) => Err(EngineError::AckTimeout {
                message_id: self.message_id,
            }),
        }
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle")
            .field("message_id", &self.message_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_delivers_payload() {
        let registry = AckRegistry::new(Duration::from_secs(5));
        let handle = registry.register("m1");

        assert!(registry.resolve("m1", json!({"ok": true})));
        let payload = handle.wait().await.unwrap();
        assert_eq!(payload, json!({"ok": true}));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let registry = AckRegistry::new(Duration::from_secs(5));
        assert!(!registry.resolve("nope", json!(null)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_waiter() {
        let registry = AckRegistry::new(Duration::from_secs(5));
        let handle = registry.register("m1");

        // Paused clock auto-advances once everything is idle.
        let err = handle.wait().await.unwrap_err();
        match err {
            EngineError::AckTimeout { message_id } => assert_eq!(message_id, "m1"),
            other => panic!("expected AckTimeout, got {other:?}"),
        }
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_after_timeout_returns_false() {
        let registry = AckRegistry::new(Duration::from_secs(5));
        let handle = registry.register("m1");

        // Let the spawned eviction task arm its timer before the clock jumps.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert!(!registry.resolve("m1", json!({"late": true})));
        assert!(handle.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_resolve_is_dropped() {
        let registry = AckRegistry::new(Duration::from_secs(5));
        let handle = registry.register("m1");

        assert!(registry.resolve("m1", json!(1)));
        assert!(!registry.resolve("m1", json!(2)));
        assert_eq!(handle.wait().await.unwrap(), json!(1));
    }
}
