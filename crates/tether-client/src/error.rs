//! Client runtime errors

use crate::transport::TransportError;

/// Failures surfaced by the client runtime.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// An operation that needs a live session ran without one.
    #[error("Not connected")]
    NotConnected,

    /// `connect` was called while a session is already running.
    #[error("Already connected")]
    AlreadyConnected,

    /// The server did not acknowledge a message in time.
    #[error("Ack timeout for message {message_id}")]
    AckTimeout { message_id: String },

    /// The underlying transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type ClientResult<T> = Result<T, ClientError>;
