//! Redis store backend.

pub mod backend;
pub mod pool;
pub mod pubsub;

pub use backend::RedisStore;
pub use pool::{RedisPool, RedisPoolConfig};
pub use pubsub::{PubSubListener, PubSubListenerConfig};
