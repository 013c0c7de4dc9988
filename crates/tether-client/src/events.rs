//! Client-side event stream

use std::time::Duration;

use tether_core::{Envelope, PresenceChange};

/// Everything the client surfaces to the application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The session is established and delivery is running.
    Connected {
        session_id: String,
        /// True when this connection resumed a prior session.
        resumed: bool,
    },
    /// An application envelope arrived (deduplicated, decompressed).
    Message(Envelope),
    /// A presence update for a watched user.
    Presence(PresenceChange),
    /// A connect or reconnect attempt was refused.
    ConnectError { reason: String },
    /// The delivery path dropped; a reconnect attempt is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Every reconnect attempt failed; the client is in the failed state.
    ReconnectFailed { attempts: u32 },
    /// The client disconnected deliberately.
    Disconnected,
}

impl ClientEvent {
    /// Short tag for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Message(_) => "message",
            Self::Presence(_) => "presence",
            Self::ConnectError { .. } => "connect_error",
            Self::Reconnecting { .. } => "reconnecting",
            Self::ReconnectFailed { .. } => "reconnect_failed",
            Self::Disconnected => "disconnected",
        }
    }
}
