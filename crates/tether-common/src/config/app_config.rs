//! Application configuration structs
//!
//! Loads configuration from environment variables with sensible defaults for
//! every tunable except the Redis connection URL.

use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app: AppSettings,
    pub redis: RedisConfig,
    pub session: SessionSettings,
    pub heartbeat: HeartbeatSettings,
    pub ack: AckSettings,
    pub auth: AuthSettings,
    pub rate_limit: RateLimitSettings,
    pub compression: CompressionSettings,
}

/// General application settings
#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub env: Environment,
}

/// Environment type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

/// Redis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: u32,
}

/// Session lifetime settings
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// Sliding TTL applied to every session record write
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
}

/// Heartbeat and presence timing settings
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSettings {
    /// How often clients are expected to send a heartbeat
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
    /// Idle time after which a tracked session is marked away
    #[serde(default = "default_away_after_secs")]
    pub away_after_secs: u64,
    /// Idle time after which a tracked session is marked offline and removed
    #[serde(default = "default_offline_after_secs")]
    pub offline_after_secs: u64,
    /// Interval between background presence sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Delivery acknowledgement settings
#[derive(Debug, Clone, Deserialize)]
pub struct AckSettings {
    /// How long an emit waits for an acknowledgement before timing out
    #[serde(default = "default_ack_timeout_ms")]
    pub timeout_ms: u64,
}

/// Token authentication settings
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// HMAC secret for connection tokens; auth is disabled when unset
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_token_expiry_secs")]
    pub token_expiry_secs: i64,
}

/// Per-session event rate limiting settings
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_events_per_second")]
    pub events_per_second: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

/// Payload compression settings
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionSettings {
    /// Serialized payloads at or above this size are gzipped; 0 disables
    #[serde(default = "default_compression_threshold")]
    pub threshold_bytes: usize,
}

// Default value functions
fn default_app_name() -> String {
    "tether".to_string()
}

fn default_env() -> Environment {
    Environment::Development
}

fn default_redis_max_connections() -> u32 {
    10
}

fn default_session_ttl_secs() -> u64 {
    3600
}

fn default_heartbeat_interval_secs() -> u64 {
    25
}

fn default_away_after_secs() -> u64 {
    300
}

fn default_offline_after_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_ack_timeout_ms() -> u64 {
    5000
}

fn default_token_expiry_secs() -> i64 {
    3600
}

fn default_events_per_second() -> u32 {
    10
}

fn default_burst() -> u32 {
    50
}

fn default_compression_threshold() -> usize {
    1024
}

/// Read an optional environment variable, failing on unparseable values
/// instead of silently falling back to the default.
fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name, raw)),
        Err(_) => Ok(None),
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    /// Returns an error if `REDIS_URL` is missing or any set variable fails
    /// to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            app: AppSettings {
                name: env::var("APP_NAME").unwrap_or_else(|_| default_app_name()),
                env: env::var("APP_ENV")
                    .ok()
                    .and_then(|s| match s.to_lowercase().as_str() {
                        "production" => Some(Environment::Production),
                        "staging" => Some(Environment::Staging),
                        "development" => Some(Environment::Development),
                        _ => None,
                    })
                    .unwrap_or_default(),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").map_err(|_| ConfigError::MissingVar("REDIS_URL"))?,
                max_connections: parse_var("REDIS_MAX_CONNECTIONS")?
                    .unwrap_or_else(default_redis_max_connections),
            },
            session: SessionSettings {
                ttl_secs: parse_var("SESSION_TTL_SECS")?.unwrap_or_else(default_session_ttl_secs),
            },
            heartbeat: HeartbeatSettings {
                interval_secs: parse_var("HEARTBEAT_INTERVAL_SECS")?
                    .unwrap_or_else(default_heartbeat_interval_secs),
                away_after_secs: parse_var("PRESENCE_AWAY_AFTER_SECS")?
                    .unwrap_or_else(default_away_after_secs),
                offline_after_secs: parse_var("PRESENCE_OFFLINE_AFTER_SECS")?
                    .unwrap_or_else(default_offline_after_secs),
                sweep_interval_secs: parse_var("PRESENCE_SWEEP_INTERVAL_SECS")?
                    .unwrap_or_else(default_sweep_interval_secs),
            },
            ack: AckSettings {
                timeout_ms: parse_var("ACK_TIMEOUT_MS")?.unwrap_or_else(default_ack_timeout_ms),
            },
            auth: AuthSettings {
                jwt_secret: env::var("JWT_SECRET").ok(),
                token_expiry_secs: parse_var("JWT_TOKEN_EXPIRY")?
                    .unwrap_or_else(default_token_expiry_secs),
            },
            rate_limit: RateLimitSettings {
                events_per_second: parse_var("RATE_LIMIT_EVENTS_PER_SECOND")?
                    .unwrap_or_else(default_events_per_second),
                burst: parse_var("RATE_LIMIT_BURST")?.unwrap_or_else(default_burst),
            },
            compression: CompressionSettings {
                threshold_bytes: parse_var("COMPRESSION_THRESHOLD_BYTES")?
                    .unwrap_or_else(default_compression_threshold),
            },
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}
