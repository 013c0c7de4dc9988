//! Session record storage.
//!
//! CRUD over durable session state with TTL-based expiry as the sole
//! lifecycle mechanism: every successful mutation resets the TTL countdown,
//! so an active session never expires while traffic continues and an idle
//! one expires exactly `ttl` after its last mutation.

use crate::backend::StoreBackend;
use crate::error::StoreResult;
use crate::keys;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{now_ms, SessionRecord};

/// Session record store
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn StoreBackend>,
    ttl: Duration,
}

impl SessionStore {
    /// Create a session store with the given sliding TTL
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Sliding TTL applied to every write
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Persist a new session record
    pub async fn create(&self, record: &SessionRecord) -> StoreResult<()> {
        let serialized = serde_json::to_string(record)?;
        self.backend
            .set(&keys::session(&record.id), &serialized, Some(self.ttl))
            .await?;

        tracing::debug!(session_id = %record.id, "Created session");
        Ok(())
    }

    /// Load a session record; absence is a normal outcome
    pub async fn get(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        match self.backend.get(&keys::session(session_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write a session record.
    ///
    /// The closure mutates the freshly loaded record; `lastActivity` and the
    /// TTL are refreshed on every successful call. Returns `false` if the
    /// record is absent, in which case the update is silently dropped; an
    /// expired session is never resurrected by a late write.
    pub async fn update<F>(&self, session_id: &str, apply: F) -> StoreResult<bool>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let Some(mut record) = self.get(session_id).await? else {
            tracing::debug!(session_id = %session_id, "Update dropped, session absent");
            return Ok(false);
        };

        apply(&mut record);
        record.last_activity = now_ms();

        let serialized = serde_json::to_string(&record)?;
        self.backend
            .set(&keys::session(session_id), &serialized, Some(self.ttl))
            .await?;
        Ok(true)
    }

    /// Refresh TTL and `lastActivity` without changing the data bag
    pub async fn touch(&self, session_id: &str) -> StoreResult<bool> {
        self.update(session_id, |_| {}).await
    }

    /// Delete a session record; deleting an absent session is not an error
    pub async fn delete(&self, session_id: &str) -> StoreResult<()> {
        self.backend.delete(&keys::session(session_id)).await?;
        tracing::debug!(session_id = %session_id, "Deleted session");
        Ok(())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
