//! Storage key namespace.
//!
//! Pure mapping from session ids, rooms, and pub/sub channels to storage key
//! strings. One key per concept, always scoped by session or room id, so two
//! deployments sharing a store never collide outside the `tether:` prefix.

/// Prefix applied to every key this crate writes
pub const KEY_PREFIX: &str = "tether:";

/// Key holding a session's state record
#[must_use]
pub fn session(session_id: &str) -> String {
    format!("{KEY_PREFIX}session:{session_id}")
}

/// Key holding a session's durable message queue
#[must_use]
pub fn queue(session_id: &str) -> String {
    format!("{KEY_PREFIX}queue:{session_id}")
}

/// Key holding the member set of a room
#[must_use]
pub fn room(room: &str) -> String {
    format!("{KEY_PREFIX}room:{room}")
}

/// Key holding the set of rooms a session has joined
#[must_use]
pub fn session_rooms(session_id: &str) -> String {
    format!("{KEY_PREFIX}session-rooms:{session_id}")
}

/// Key holding a session's presence snapshot
#[must_use]
pub fn presence(session_id: &str) -> String {
    format!("{KEY_PREFIX}presence:{session_id}")
}

/// Key holding a session's last heartbeat timestamp
#[must_use]
pub fn heartbeat(session_id: &str) -> String {
    format!("{KEY_PREFIX}heartbeat:{session_id}")
}

/// Channel name prefix for per-session push channels
pub const SESSION_CHANNEL_PREFIX: &str = "tether:channel:";
/// Channel name prefix for per-namespace broadcast channels
pub const BROADCAST_CHANNEL_PREFIX: &str = "tether:broadcast:";

/// Pub/sub channel types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Push channel for a single session
    Session(String),
    /// Shared broadcast channel for one namespace
    Broadcast(String),
}

impl Channel {
    /// Create a session channel
    #[must_use]
    pub fn session(session_id: impl Into<String>) -> Self {
        Self::Session(session_id.into())
    }

    /// Create a namespace broadcast channel
    #[must_use]
    pub fn broadcast(namespace: impl Into<String>) -> Self {
        Self::Broadcast(namespace.into())
    }

    /// Get the store-level channel name
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Session(id) => format!("{SESSION_CHANNEL_PREFIX}{id}"),
            Self::Broadcast(ns) => format!("{BROADCAST_CHANNEL_PREFIX}{ns}"),
        }
    }

    /// Parse a store-level channel name back to a `Channel`
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(id) = name.strip_prefix(SESSION_CHANNEL_PREFIX) {
            return Some(Self::Session(id.to_string()));
        }
        if let Some(ns) = name.strip_prefix(BROADCAST_CHANNEL_PREFIX) {
            return Some(Self::Broadcast(ns.to_string()));
        }
        None
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
