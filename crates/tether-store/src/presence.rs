//! Durable presence snapshots.
//!
//! The presence tracker keeps its working state in memory; this store holds
//! the per-session presence and heartbeat keys so presence survives process
//! restarts and is visible to other instances sharing the store. Keys carry
//! the session TTL and vanish with the session.

use crate::backend::StoreBackend;
use crate::error::StoreResult;
use crate::keys;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{now_ms, PresenceStatus};

/// Durable per-session presence snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPresence {
    /// User this session belongs to
    pub user_id: String,
    /// Current status
    pub status: PresenceStatus,
    /// Last seen timestamp (epoch ms)
    pub last_seen: i64,
}

impl SessionPresence {
    /// Create a snapshot marked as seen now
    #[must_use]
    pub fn new(user_id: impl Into<String>, status: PresenceStatus) -> Self {
        Self {
            user_id: user_id.into(),
            status,
            last_seen: now_ms(),
        }
    }
}

/// Presence snapshot store
#[derive(Clone)]
pub struct PresenceStore {
    backend: Arc<dyn StoreBackend>,
    ttl: Duration,
}

impl PresenceStore {
    /// Create a presence store; `ttl` should match the session TTL
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Persist a session's presence snapshot
    pub async fn save(&self, session_id: &str, snapshot: &SessionPresence) -> StoreResult<()> {
        let serialized = serde_json::to_string(snapshot)?;
        self.backend
            .set(&keys::presence(session_id), &serialized, Some(self.ttl))
            .await
    }

    /// Load a session's presence snapshot
    pub async fn load(&self, session_id: &str) -> StoreResult<Option<SessionPresence>> {
        match self.backend.get(&keys::presence(session_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Record a heartbeat timestamp for a session
    pub async fn beat(&self, session_id: &str) -> StoreResult<()> {
        self.backend
            .set(
                &keys::heartbeat(session_id),
                &now_ms().to_string(),
                Some(self.ttl),
            )
            .await
    }

    /// Last recorded heartbeat timestamp (epoch ms), if any
    pub async fn last_beat(&self, session_id: &str) -> StoreResult<Option<i64>> {
        Ok(self
            .backend
            .get(&keys::heartbeat(session_id))
            .await?
            .and_then(|raw| raw.parse().ok()))
    }

    /// Remove a session's presence and heartbeat keys
    pub async fn clear(&self, session_id: &str) -> StoreResult<()> {
        self.backend.delete(&keys::presence(session_id)).await?;
        self.backend.delete(&keys::heartbeat(session_id)).await?;
        Ok(())
    }
}

impl std::fmt::Debug for PresenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
