//! # tether-common
//!
//! Shared utilities including configuration, token authentication, telemetry,
//! and payload compression.

pub mod auth;
pub mod compress;
pub mod config;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use auth::{AuthError, Claims, TokenService};
pub use compress::{
    decompress_payload, gunzip_base64, gzip_base64, maybe_compress, CompressError, MARKER_FIELD,
};
pub use config::{
    AckSettings, AppConfig, AppSettings, AuthSettings, CompressionSettings, ConfigError,
    Environment, HeartbeatSettings, RateLimitSettings, RedisConfig, SessionSettings,
};
pub use telemetry::{
    init_tracing, init_tracing_with_config, try_init_tracing, try_init_tracing_with_config,
    TracingConfig, TracingError,
};
