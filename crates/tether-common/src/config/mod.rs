//! Configuration loading

pub mod app_config;

pub use app_config::{
    AckSettings, AppConfig, AppSettings, AuthSettings, CompressionSettings, ConfigError,
    Environment, HeartbeatSettings, RateLimitSettings, RedisConfig, SessionSettings,
};
