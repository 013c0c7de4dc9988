//! Engine configuration
//!
//! Tunables for session lifetime, delivery, presence, and compression.
//! Defaults match the values the client library assumes, so a stock
//! engine and a stock client agree without coordination.

use std::time::Duration;

use tether_common::AppConfig;
use tether_store::DEFAULT_MAX_QUEUE_LEN;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sliding session lifetime. Every touched session lives this much longer.
    pub session_ttl: Duration,
    /// How long an emit-with-ack waits before resolving as timed out.
    pub ack_timeout: Duration,
    /// Fallback before the connect handler runs when a client never
    /// signals readiness (no subscribe, no poll, no message).
    pub ready_timeout: Duration,
    /// Interval clients are told to ping at.
    pub heartbeat_interval: Duration,
    /// Whether presence tracking and the sweeper run at all.
    pub presence_enabled: bool,
    /// Idle time after which an online user is marked away.
    pub away_after: Duration,
    /// Idle time after which an away user is marked offline and untracked.
    pub offline_after: Duration,
    /// How often the presence sweeper scans for idle users.
    pub sweep_interval: Duration,
    /// Payloads at or above this many serialized bytes are gzipped. Zero disables.
    pub compression_threshold: usize,
    /// Maximum entries retained per session queue. Oldest entries are dropped first.
    pub max_queue_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(3600),
            ack_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
            presence_enabled: true,
            away_after: Duration::from_secs(300),
            offline_after: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            compression_threshold: 1024,
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_presence_enabled(mut self, enabled: bool) -> Self {
        self.presence_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_away_after(mut self, idle: Duration) -> Self {
        self.away_after = idle;
        self
    }

    #[must_use]
    pub fn with_offline_after(mut self, idle: Duration) -> Self {
        self.offline_after = idle;
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    #[must_use]
    pub fn with_max_queue_len(mut self, max_len: usize) -> Self {
        self.max_queue_len = max_len;
        self
    }
}

impl From<&AppConfig> for EngineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            session_ttl: Duration::from_secs(config.session.ttl_secs),
            ack_timeout: Duration::from_millis(config.ack.timeout_ms),
            heartbeat_interval: Duration::from_secs(config.heartbeat.interval_secs),
            away_after: Duration::from_secs(config.heartbeat.away_after_secs),
            offline_after: Duration::from_secs(config.heartbeat.offline_after_secs),
            sweep_interval: Duration::from_secs(config.heartbeat.sweep_interval_secs),
            compression_threshold: config.compression.threshold_bytes,
            ..Self::default()
        }
    }
}
