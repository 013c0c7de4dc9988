//! Reserved event names.
//!
//! Events under [`RESERVED_PREFIX`] are consumed by the session layer itself
//! and must not be used by application code. Colliding application event
//! names produce undefined behavior (not defended against).

/// Prefix for all session-layer events.
pub const RESERVED_PREFIX: &str = "__tether:";

/// Client heartbeat ping.
pub const EVENT_PING: &str = "__tether:ping";
/// Server heartbeat reply.
pub const EVENT_PONG: &str = "__tether:pong";
/// Presence status change notification (and client-initiated status update).
pub const EVENT_PRESENCE: &str = "__tether:presence";
/// Start receiving presence change notifications.
pub const EVENT_PRESENCE_SUBSCRIBE: &str = "__tether:presence_subscribe";
/// Stop receiving presence change notifications.
pub const EVENT_PRESENCE_UNSUBSCRIBE: &str = "__tether:presence_unsubscribe";
/// Acknowledgment response sentinel; `data` is `{messageId, data}`.
pub const EVENT_ACK: &str = "__tether:ack";

/// Whether an event name is reserved for the session layer.
#[must_use]
pub fn is_reserved(event: &str) -> bool {
    event.starts_with(RESERVED_PREFIX)
}
