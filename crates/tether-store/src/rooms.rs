//! Room membership registry.
//!
//! Two-sided index: a member set per room and a room set per session. Both
//! sides of every join/leave are batched into a single atomic store request
//! so the indices cannot diverge when one side's write fails.

use crate::backend::StoreBackend;
use crate::error::StoreResult;
use crate::keys;
use std::sync::Arc;

/// Room membership registry
#[derive(Clone)]
pub struct RoomRegistry {
    backend: Arc<dyn StoreBackend>,
}

impl RoomRegistry {
    /// Create a room registry
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Add a session to a room; idempotent on both indices
    pub async fn join(&self, session_id: &str, room: &str) -> StoreResult<()> {
        self.backend
            .set_update(
                &[
                    (keys::room(room), session_id.to_string()),
                    (keys::session_rooms(session_id), room.to_string()),
                ],
                &[],
            )
            .await?;

        tracing::debug!(session_id = %session_id, room = %room, "Joined room");
        Ok(())
    }

    /// Remove a session from a room; idempotent on both indices
    pub async fn leave(&self, session_id: &str, room: &str) -> StoreResult<()> {
        self.backend
            .set_update(
                &[],
                &[
                    (keys::room(room), session_id.to_string()),
                    (keys::session_rooms(session_id), room.to_string()),
                ],
            )
            .await?;

        tracing::debug!(session_id = %session_id, room = %room, "Left room");
        Ok(())
    }

    /// All sessions currently in a room
    pub async fn members_of(&self, room: &str) -> StoreResult<Vec<String>> {
        self.backend.set_members(&keys::room(room)).await
    }

    /// All rooms a session has joined
    pub async fn rooms_of(&self, session_id: &str) -> StoreResult<Vec<String>> {
        self.backend
            .set_members(&keys::session_rooms(session_id))
            .await
    }

    /// Release every room membership a session holds, returning the rooms
    /// it left. Used by disconnect cleanup.
    pub async fn leave_all(&self, session_id: &str) -> StoreResult<Vec<String>> {
        let rooms = self.rooms_of(session_id).await?;
        if rooms.is_empty() {
            return Ok(rooms);
        }

        let removes: Vec<(String, String)> = rooms
            .iter()
            .flat_map(|room| {
                [
                    (keys::room(room), session_id.to_string()),
                    (keys::session_rooms(session_id), room.to_string()),
                ]
            })
            .collect();
        self.backend.set_update(&[], &removes).await?;

        tracing::debug!(session_id = %session_id, count = rooms.len(), "Released all room memberships");
        Ok(rooms)
    }
}

impl std::fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRegistry").finish_non_exhaustive()
    }
}
