//! Presence types.
//!
//! Presence is tracked per logical user, not per session: one user may hold
//! several concurrent sessions (multi-device) and the user's status is the
//! union: online if any session is online.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// User presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// At least one session is active.
    Online,
    /// No activity for the away threshold (default 5 minutes).
    Away,
    /// User-set do-not-disturb.
    Busy,
    /// No live sessions.
    Offline,
}

impl Default for PresenceStatus {
    fn default() -> Self {
        Self::Offline
    }
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Away => write!(f, "away"),
            Self::Busy => write!(f, "busy"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for PresenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "away" => Ok(Self::Away),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            _ => Err(format!("Invalid presence status: {s}")),
        }
    }
}

/// Per-user presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Logical user ID (application-defined, not a session ID).
    pub user_id: String,
    /// Current status (union over the user's sessions).
    pub status: PresenceStatus,
    /// Last heartbeat or status change (Unix ms).
    pub last_seen: i64,
    /// Optional application data (e.g., device, activity).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Live session IDs for this user.
    #[serde(default)]
    pub sessions: Vec<String>,
}

impl PresenceRecord {
    /// Create a record for a user with one session.
    #[must_use]
    pub fn new(user_id: impl Into<String>, status: PresenceStatus) -> Self {
        Self {
            user_id: user_id.into(),
            status,
            last_seen: crate::now_ms(),
            data: None,
            sessions: Vec::new(),
        }
    }

    /// Attach application data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Register a session under this user (idempotent).
    pub fn add_session(&mut self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        if !self.sessions.contains(&session_id) {
            self.sessions.push(session_id);
        }
    }

    /// Remove a session; returns true if it was the last one.
    pub fn remove_session(&mut self, session_id: &str) -> bool {
        self.sessions.retain(|s| s != session_id);
        self.sessions.is_empty()
    }

    /// Refresh `last_seen` to now.
    pub fn touch(&mut self) {
        self.last_seen = crate::now_ms();
    }

    /// Milliseconds since `last_seen`.
    #[must_use]
    pub fn idle_ms(&self) -> i64 {
        (crate::now_ms() - self.last_seen).max(0)
    }
}

/// Payload handed to presence listeners on every status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceChange {
    pub user_id: String,
    /// Session that triggered the change, when one did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: PresenceStatus,
    pub timestamp: i64,
}

impl PresenceChange {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        session_id: Option<String>,
        status: PresenceStatus,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id,
            status,
            timestamp: crate::now_ms(),
        }
    }
}
