//! # tether-engine
//!
//! The serverless session engine: durable sessions and at-least-once
//! delivery without a single persistent socket on the server side.
//!
//! ## Features
//!
//! - **Lifecycle**: connect / message / disconnect orchestration with
//!   middleware, rollback, and resume catch-up
//! - **Delivery**: per-session durable queues for catch-up plus pub/sub
//!   channels for live push, composed behind one session handle
//! - **Routing**: immutable event handler table with namespace scoping
//! - **Acknowledgements**: registry of emits awaiting client acks, with
//!   timeout eviction
//! - **Presence**: per-user status tracking with idle sweep and watcher
//!   fan-out
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_engine::{ConnectOptions, Engine, EngineConfig, RoutingTable};
//! use tether_store::MemoryStore;
//!
//! let routing = RoutingTable::builder()
//!     .on("chat", |ctx| async move {
//!         ctx.handle.broadcast_to_room("lobby", "chat", ctx.data).await?;
//!         Ok(None)
//!     })
//!     .build();
//!
//! let engine = Engine::new(Arc::new(MemoryStore::new()), routing, EngineConfig::default());
//! let reply = engine.connect(ConnectOptions::default()).await?;
//! ```

pub mod acks;
pub mod config;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod middleware;
pub mod presence;
pub mod routing;

pub use acks::{AckHandle, AckRegistry};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use handle::{BroadcastOptions, SessionHandle};
pub use lifecycle::{
    ConnectOptions, ConnectReply, Engine, MessageOptions, MessageStream, ResumeOptions,
};
pub use middleware::{
    ConnectContext, MessageContext, Middleware, PayloadValidation, RateLimit, TokenAuth, Trace,
};
pub use presence::PresenceTracker;
pub use routing::{
    EventHandler, HandlerContext, LifecycleHandler, RoutingTable, RoutingTableBuilder,
};
