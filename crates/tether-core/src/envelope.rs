//! Wire message envelope.
//!
//! Every event that crosses a process boundary (queue entry, pub/sub payload,
//! stream frame, poll response) is one UTF-8 JSON object in this shape. The
//! field names are part of the wire contract and must not change.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single application event in transit.
///
/// `event` and `data` are required; everything else is optional and omitted
/// from the JSON when absent. `data` is opaque to the session layer and must
/// round-trip through serialization unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Event name. Names under the reserved prefix belong to the session
    /// layer itself (see [`crate::events`]).
    pub event: String,

    /// Arbitrary JSON payload.
    pub data: Value,

    /// Creation time in Unix milliseconds. Used for watermark filtering on
    /// reconnect catch-up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// Originating session ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Unique message ID; present iff an acknowledgment was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Whether the sender expects an acknowledgment for this message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_ack: Option<bool>,

    /// Logical namespace the event belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Volatile messages skip the durable queue entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volatile: Option<bool>,

    /// When true, `data` is a compression marker object
    /// (`{"__compressed": true, "data": "<base64 gzip>"}`) and the consumer
    /// must expand it before dispatching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed: Option<bool>,
}

impl Envelope {
    /// Create an envelope with the current timestamp and no optional fields.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: Some(crate::now_ms()),
            session_id: None,
            message_id: None,
            requires_ack: None,
            namespace: None,
            volatile: None,
            compressed: None,
        }
    }

    /// Set the originating session ID.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach a message ID and mark the envelope as requiring an ack.
    #[must_use]
    pub fn with_ack_request(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self.requires_ack = Some(true);
        self
    }

    /// Set the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Mark the envelope as volatile (never queued durably).
    #[must_use]
    pub fn volatile(mut self) -> Self {
        self.volatile = Some(true);
        self
    }

    /// Whether the sender asked for an acknowledgment.
    #[must_use]
    pub fn wants_ack(&self) -> bool {
        self.requires_ack.unwrap_or(false) && self.message_id.is_some()
    }

    /// Whether the envelope is marked volatile.
    #[must_use]
    pub fn is_volatile(&self) -> bool {
        self.volatile.unwrap_or(false)
    }

    /// Whether `data` carries the compression marker.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compressed.unwrap_or(false)
    }

    /// Whether this is a reserved (session-layer) event.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        crate::events::is_reserved(&self.event)
    }

    /// Serialize to the wire JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from the wire JSON string.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
