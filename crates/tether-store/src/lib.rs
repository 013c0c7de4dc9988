//! # tether-store
//!
//! Persistent store gateway for the session layer.
//!
//! ## Features
//!
//! - **Gateway contract**: key-value with TTL, lists, sets, and pub/sub
//!   behind one trait, so the session layer never sees a store transport
//! - **Redis backend**: deadpool-managed connections, pipelined compound
//!   operations, and a reconnecting pub/sub listener
//! - **Memory backend**: full contract against process-local maps, with
//!   TTLs driven by `tokio::time` for deterministic tests
//! - **Typed stores**: sessions, per-session message queues, room indices,
//!   and presence snapshots over the gateway
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tether_store::{MemoryStore, MessageQueue, SessionStore};
//!
//! let backend = Arc::new(MemoryStore::new());
//! let sessions = SessionStore::new(backend.clone(), Duration::from_secs(3600));
//! let queue = MessageQueue::new(backend, Duration::from_secs(3600));
//!
//! sessions.create(&record).await?;
//! queue.enqueue(&record.id, &envelope).await?;
//! ```

pub mod backend;
pub mod error;
pub mod keys;
pub mod memory;
pub mod presence;
pub mod queue;
pub mod redis;
pub mod rooms;
pub mod session;

// Re-export gateway types
pub use backend::{StoreBackend, Subscription};
pub use error::{StoreError, StoreResult};
pub use keys::Channel;
pub use memory::MemoryStore;

// Re-export the Redis backend (self:: disambiguates from the redis crate)
pub use self::redis::{PubSubListener, PubSubListenerConfig, RedisPool, RedisPoolConfig, RedisStore};

// Re-export typed stores
pub use presence::{PresenceStore, SessionPresence};
pub use queue::{MessageQueue, DEFAULT_MAX_QUEUE_LEN};
pub use rooms::RoomRegistry;
pub use session::SessionStore;
