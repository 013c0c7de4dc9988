//! # tether-client
//!
//! Client runtime for the tether session layer. Mirrors the server's
//! session abstraction from the caller's side: one [`SessionClient`]
//! owns a logical session over an abstract [`ClientTransport`] and keeps
//! it alive across transport failures.
//!
//! ## Features
//!
//! - **Reconnection**: exponential backoff with jitter, watermark-carrying
//!   resume, missed-message replay
//! - **Deduplication**: bounded recently-seen set so handlers observe each
//!   message ID once even under replay overlap
//! - **Acknowledgments**: local ack waiters mirroring the server pattern,
//!   resolved by direct response or the ack sentinel event
//! - **Transport switching**: streaming push or polling pull, switchable
//!   at runtime without losing the session
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_client::{ClientConfig, ClientEvent, SessionClient};
//!
//! let client = SessionClient::new(transport, ClientConfig::default());
//! let mut events = client.events();
//! client.connect().await?;
//! client.emit("chat", serde_json::json!({"text": "hi"})).await?;
//! while let Ok(event) = events.recv().await {
//!     if let ClientEvent::Message(envelope) = event {
//!         println!("{}: {}", envelope.event, envelope.data);
//!     }
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod dedup;
pub mod error;
pub mod events;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use client::{ClientConfig, ClientState, SessionClient, TransportMode};
pub use dedup::SeenSet;
pub use error::{ClientError, ClientResult};
pub use events::ClientEvent;
pub use transport::{
    ClientTransport, ConnectRequest, ConnectResponse, ResumeRequest, TransportError,
    TransportStream,
};
