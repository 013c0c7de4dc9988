//! In-memory store backend.
//!
//! Implements the full gateway contract against process-local maps, with
//! real TTL semantics driven by `tokio::time::Instant` so tests can run
//! under paused time. Used for unit and integration testing and for
//! single-process embedding where no external store exists.

use crate::backend::{StoreBackend, Subscription};
use crate::error::StoreResult;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug)]
struct Cell<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Cell<T> {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// Process-local store backend
#[derive(Debug, Default)]
pub struct MemoryStore {
    strings: DashMap<String, Cell<String>>,
    lists: DashMap<String, Cell<Vec<String>>>,
    sets: DashMap<String, Cell<HashSet<String>>>,
    channels: DashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

impl MemoryStore {
    /// Create an empty in-memory store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let expired = match self.strings.get(key) {
            Some(cell) if cell.live() => return Ok(Some(cell.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            // Lazy expiry: the guard is dropped by now, safe to remove
            self.strings.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let cell = Cell {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.strings.insert(key.to_string(), cell);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let s = self.strings.remove(key).is_some_and(|(_, c)| c.live());
        let l = self.lists.remove(key).is_some_and(|(_, c)| c.live());
        let m = self.sets.remove(key).is_some_and(|(_, c)| c.live());
        Ok(s || l || m)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let deadline = Instant::now() + ttl;

        if let Some(mut cell) = self.strings.get_mut(key) {
            if cell.live() {
                cell.expires_at = Some(deadline);
                return Ok(true);
            }
        }
        if let Some(mut cell) = self.lists.get_mut(key) {
            if cell.live() {
                cell.expires_at = Some(deadline);
                return Ok(true);
            }
        }
        if let Some(mut cell) = self.sets.get_mut(key) {
            if cell.live() {
                cell.expires_at = Some(deadline);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn list_append(
        &self,
        key: &str,
        value: &str,
        max_len: Option<usize>,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let mut entry = self.lists.entry(key.to_string()).or_insert_with(|| Cell {
            value: Vec::new(),
            expires_at: None,
        });
        if !entry.live() {
            entry.value.clear();
            entry.expires_at = None;
        }

        entry.value.push(value.to_string());
        if let Some(max) = max_len {
            let len = entry.value.len();
            if len > max {
                entry.value.drain(..len - max);
            }
        }
        if let Some(t) = ttl {
            entry.expires_at = Some(Instant::now() + t);
        }
        Ok(())
    }

    async fn list_drain(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lists
            .remove(key)
            .filter(|(_, c)| c.live())
            .map(|(_, c)| c.value)
            .unwrap_or_default())
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        Ok(self
            .lists
            .get(key)
            .filter(|c| c.live())
            .map_or(0, |c| c.value.len()))
    }

    async fn set_update(
        &self,
        add: &[(String, String)],
        remove: &[(String, String)],
    ) -> StoreResult<()> {
        for (key, member) in add {
            let mut entry = self.sets.entry(key.clone()).or_insert_with(|| Cell {
                value: HashSet::new(),
                expires_at: None,
            });
            if !entry.live() {
                entry.value.clear();
                entry.expires_at = None;
            }
            entry.value.insert(member.clone());
        }

        for (key, member) in remove {
            if let Some(mut entry) = self.sets.get_mut(key) {
                entry.value.remove(member);
                let now_empty = entry.value.is_empty();
                drop(entry);
                if now_empty {
                    // Empty sets do not exist, matching store-level semantics
                    self.sets.remove_if(key, |_, c| c.value.is_empty());
                }
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let expired = match self.sets.get(key) {
            Some(cell) if cell.live() => {
                return Ok(cell.value.iter().cloned().collect());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.sets.remove(key);
        }
        Ok(Vec::new())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        let mut delivered = 0;
        if let Some(mut senders) = self.channels.get_mut(channel) {
            senders.retain(|tx| {
                if tx.send(payload.to_string()).is_ok() {
                    delivered += 1;
                    true
                } else {
                    false
                }
            });
            let empty = senders.is_empty();
            drop(senders);
            if empty {
                self.channels.remove_if(channel, |_, v| v.is_empty());
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.entry(channel.to_string()).or_default().push(tx);
        Ok(Subscription::new(channel.to_string(), rx, None))
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, Duration};

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = MemoryStore::new();

        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();

        store
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_slides_deadline() {
        let store = MemoryStore::new();

        store
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        advance(Duration::from_secs(8)).await;
        assert!(store.expire("k", Duration::from_secs(10)).await.unwrap());

        advance(Duration::from_secs(8)).await;
        assert!(store.get("k").await.unwrap().is_some());

        advance(Duration::from_secs(3)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.expire("k", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_append_drain_order() {
        let store = MemoryStore::new();

        for v in ["a", "b", "c"] {
            store.list_append("q", v, None, None).await.unwrap();
        }
        assert_eq!(store.list_len("q").await.unwrap(), 3);

        let drained = store.list_drain("q").await.unwrap();
        assert_eq!(drained, vec!["a", "b", "c"]);

        assert!(store.list_drain("q").await.unwrap().is_empty());
        assert_eq!(store.list_len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_trim_keeps_newest() {
        let store = MemoryStore::new();

        for v in ["a", "b", "c", "d"] {
            store.list_append("q", v, Some(2), None).await.unwrap();
        }

        let drained = store.list_drain("q").await.unwrap();
        assert_eq!(drained, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_set_update_batches_both_indices() {
        let store = MemoryStore::new();

        store
            .set_update(
                &[
                    ("room:lobby".into(), "s1".into()),
                    ("rooms:s1".into(), "lobby".into()),
                ],
                &[],
            )
            .await
            .unwrap();

        assert_eq!(store.set_members("room:lobby").await.unwrap(), vec!["s1"]);
        assert_eq!(store.set_members("rooms:s1").await.unwrap(), vec!["lobby"]);

        store
            .set_update(
                &[],
                &[
                    ("room:lobby".into(), "s1".into()),
                    ("rooms:s1".into(), "lobby".into()),
                ],
            )
            .await
            .unwrap();

        assert!(store.set_members("room:lobby").await.unwrap().is_empty());
        assert!(store.set_members("rooms:s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let store = MemoryStore::new();

        let mut sub = store.subscribe("ch").await.unwrap();
        let delivered = store.publish("ch", "hello").await.unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(sub.recv().await, Some("hello".to_string()));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("ch", "hello").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let store = MemoryStore::new();

        let sub = store.subscribe("ch").await.unwrap();
        drop(sub);

        assert_eq!(store.publish("ch", "hello").await.unwrap(), 0);
        assert!(!store.channels.contains_key("ch"));
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let store = MemoryStore::new();

        store.set("k", "v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}
