//! Session records.
//!
//! A session is the durable stand-in for a logical client connection. The
//! record exists in the store if and only if the connection is considered
//! live; absence (including TTL expiry) is equivalent to disconnection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Default namespace for sessions that do not request one.
pub const DEFAULT_NAMESPACE: &str = "/";

/// Stored session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque unique token, constant for the session lifetime.
    pub id: String,
    /// Creation time (Unix ms).
    pub created_at: i64,
    /// Last mutation time (Unix ms); refreshed on every update.
    pub last_activity: i64,
    /// Logical namespace; scopes handler lookup and broadcast.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Open key/value bag owned by application code. Infrastructure never
    /// writes here; mutation goes through the session handle only.
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl SessionRecord {
    /// Create a fresh record with an empty data bag.
    #[must_use]
    pub fn new(id: impl Into<String>, namespace: impl Into<String>) -> Self {
        let now = crate::now_ms();
        Self {
            id: id.into(),
            created_at: now,
            last_activity: now,
            namespace: namespace.into(),
            data: HashMap::new(),
        }
    }

    /// Read a value from the data bag.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Write a value into the data bag and refresh `last_activity`.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
        self.touch();
    }

    /// Remove a value from the data bag.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.data.remove(key);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Refresh `last_activity` to now.
    pub fn touch(&mut self) {
        self.last_activity = crate::now_ms();
    }

    /// Milliseconds since the last mutation.
    #[must_use]
    pub fn idle_ms(&self) -> i64 {
        (crate::now_ms() - self.last_activity).max(0)
    }
}
