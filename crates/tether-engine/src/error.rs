//! Engine error types
//!
//! Unified error type for lifecycle, routing, and delivery operations.

use tether_common::CompressError;
use tether_store::StoreError;

/// Engine-level error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The session does not exist (expired, disconnected, or never created)
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A connect middleware rejected the handshake
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// An inbound event failed validation
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// The session exceeded its event rate budget
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// No acknowledgement arrived within the ack window
    #[error("Acknowledgement timed out for message {message_id}")]
    AckTimeout { message_id: String },

    /// A registered event handler returned an error
    #[error("Handler error: {0}")]
    Handler(#[source] anyhow::Error),

    /// Payload compression or decompression failure
    #[error("Compression error: {0}")]
    Compression(#[from] CompressError),

    /// Envelope or payload serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage layer failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Stable error code for wire payloads and logs
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::AckTimeout { .. } => "ACK_TIMEOUT",
            Self::Handler(_) => "HANDLER_ERROR",
            Self::Compression(_) => "COMPRESSION_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    /// Whether the caller can retry the operation as-is
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimitExceeded | Self::AckTimeout { .. } | Self::Store(_))
    }
}

/// Result alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
