//! Client transport contract
//!
//! The client runtime is transport-agnostic: anything that can carry the
//! five session operations (connect, send, disconnect, poll, stream) can
//! back a [`ClientTransport`]. Adapters decide the actual wire: HTTP
//! long-poll, server-sent events, or an in-process engine for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tether_core::Envelope;
use tokio::sync::mpsc;

/// Transport-level failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connect handshake was refused or unreachable.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The server no longer knows this session (expired or disconnected).
    #[error("Session expired")]
    SessionExpired,

    /// A send or poll failed for a reason other than session loss.
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// The transport has been shut down.
    #[error("Transport closed")]
    Closed,
}

/// Connect handshake parameters.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub namespace: Option<String>,
    pub data: HashMap<String, Value>,
    pub auth: Option<String>,
    /// Previous session and last-seen watermark for catch-up.
    pub resume: Option<ResumeRequest>,
}

/// Catch-up parameters carried inside a [`ConnectRequest`].
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub session_id: String,
    pub watermark: i64,
}

/// What the server answered a connect with.
#[derive(Debug)]
pub struct ConnectResponse {
    pub session_id: String,
    /// Backlog replayed from a resumed session, oldest first.
    pub missed: Vec<Envelope>,
}

/// Push stream of inbound envelopes.
///
/// Dropping the stream runs the close hook, which the transport uses to
/// release its server-side subscription.
pub struct TransportStream {
    rx: mpsc::UnboundedReceiver<Envelope>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl TransportStream {
    #[must_use]
    pub fn new(rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { rx, on_close: None }
    }

    #[must_use]
    pub fn with_close_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Next envelope, or `None` once the stream has closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

impl Drop for TransportStream {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStream").finish_non_exhaustive()
    }
}

/// The five operations every transport must carry.
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    /// Open a session, optionally resuming a previous one.
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse, TransportError>;

    /// Deliver one envelope to the server; the reply, when the server
    /// produces one inline, comes back directly.
    async fn send(
        &self,
        session_id: &str,
        envelope: &Envelope,
    ) -> Result<Option<Value>, TransportError>;

    /// End the session server-side.
    async fn disconnect(&self, session_id: &str) -> Result<(), TransportError>;

    /// Drain the session's durable queue (pull delivery).
    async fn poll(&self, session_id: &str) -> Result<Vec<Envelope>, TransportError>;

    /// Open the push delivery path.
    async fn open_stream(&self, session_id: &str) -> Result<TransportStream, TransportError>;
}
