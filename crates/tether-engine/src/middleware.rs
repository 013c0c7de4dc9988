//! Connect and message middleware
//!
//! Middleware runs in registration order. Connect middleware can veto a
//! handshake (the engine rolls the session back); message middleware can
//! veto a single event. The built-ins cover token auth, per-session rate
//! limiting, and payload validation.

use std::num::NonZeroU32;

use async_trait::async_trait;
use governor::{DefaultKeyedRateLimiter, Quota};
use serde_json::Value;
use tether_common::TokenService;
use tether_core::SessionRecord;
use validator::Validate;

use crate::error::{EngineError, EngineResult};

/// What connect middleware sees: the freshly created session plus the
/// client's auth material, before the connect handler runs.
pub struct ConnectContext<'a> {
    pub session: &'a SessionRecord,
    /// Bearer token supplied at connect time, if any.
    pub auth: Option<&'a str>,
}

/// What message middleware sees for one inbound event.
pub struct MessageContext<'a> {
    pub session: &'a SessionRecord,
    pub event: &'a str,
    pub data: &'a Value,
}

/// Hook into the connect handshake and the inbound message path.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn on_connect(&self, _ctx: &ConnectContext<'_>) -> EngineResult<()> {
        Ok(())
    }

    async fn on_message(&self, _ctx: &MessageContext<'_>) -> EngineResult<()> {
        Ok(())
    }
}

/// Rejects connects that do not carry a verifiable JWT.
pub struct TokenAuth {
    tokens: TokenService,
}

impl TokenAuth {
    #[must_use]
    pub fn new(tokens: TokenService) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Middleware for TokenAuth {
    fn name(&self) -> &str {
        "token-auth"
    }

    async fn on_connect(&self, ctx: &ConnectContext<'_>) -> EngineResult<()> {
        let token = ctx
            .auth
            .ok_or_else(|| EngineError::AuthenticationFailed("missing token".to_string()))?;
        let claims = self
            .tokens
            .verify(token)
            .map_err(|e| EngineError::AuthenticationFailed(e.to_string()))?;

        tracing::debug!(
            session_id = %ctx.session.id,
            subject = %claims.sub,
            "Connect token verified"
        );
        Ok(())
    }
}

impl std::fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuth").finish_non_exhaustive()
    }
}

/// Per-session inbound rate limiter.
///
/// Keyed by session ID, so one chatty session cannot exhaust another's
/// budget. Connects are not counted, only messages.
pub struct RateLimit {
    limiter: DefaultKeyedRateLimiter<String>,
}

impl RateLimit {
    /// `events_per_second` refills the budget; `burst` caps it. Zero
    /// values are clamped to one.
    #[must_use]
    pub fn new(events_per_second: u32, burst: u32) -> Self {
        let per_second = NonZeroU32::new(events_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(per_second);
        let quota = Quota::per_second(per_second).allow_burst(burst);
        Self {
            limiter: DefaultKeyedRateLimiter::keyed(quota),
        }
    }
}

#[async_trait]
impl Middleware for RateLimit {
    fn name(&self) -> &str {
        "rate-limit"
    }

    async fn on_message(&self, ctx: &MessageContext<'_>) -> EngineResult<()> {
        if self.limiter.check_key(&ctx.session.id).is_err() {
            tracing::warn!(
                session_id = %ctx.session.id,
                event = %ctx.event,
                "Rate limit exceeded"
            );
            return Err(EngineError::RateLimitExceeded);
        }
        Ok(())
    }
}

impl std::fmt::Debug for RateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimit").finish_non_exhaustive()
    }
}

#[derive(Debug, Validate)]
struct EventShape {
    #[validate(length(min = 1, max = 128))]
    event: String,
}

/// Validates event names and bounds payload size.
#[derive(Debug, Clone)]
pub struct PayloadValidation {
    max_payload_bytes: usize,
}

impl PayloadValidation {
    /// `max_payload_bytes` of zero disables the size check.
    #[must_use]
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }
}

impl Default for PayloadValidation {
    fn default() -> Self {
        // 64 KiB of serialized JSON per event.
        Self::new(64 * 1024)
    }
}

#[async_trait]
impl Middleware for PayloadValidation {
    fn name(&self) -> &str {
        "payload-validation"
    }

    async fn on_message(&self, ctx: &MessageContext<'_>) -> EngineResult<()> {
        let shape = EventShape {
            event: ctx.event.to_string(),
        };
        shape
            .validate()
            .map_err(|e| EngineError::ValidationFailed(e.to_string()))?;

        if self.max_payload_bytes > 0 {
            let size = serde_json::to_vec(ctx.data)
                .map_err(|e| EngineError::ValidationFailed(format!("unserializable payload: {e}")))?
                .len();
            if size > self.max_payload_bytes {
                return Err(EngineError::ValidationFailed(format!(
                    "payload is {size} bytes, limit is {}",
                    self.max_payload_bytes
                )));
            }
        }
        Ok(())
    }
}

/// Logs every connect and message; never rejects anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trace;

#[async_trait]
impl Middleware for Trace {
    fn name(&self) -> &str {
        "trace"
    }

    async fn on_connect(&self, ctx: &ConnectContext<'_>) -> EngineResult<()> {
        tracing::info!(
            session_id = %ctx.session.id,
            namespace = %ctx.session.namespace,
            authenticated = ctx.auth.is_some(),
            "Session connecting"
        );
        Ok(())
    }

    async fn on_message(&self, ctx: &MessageContext<'_>) -> EngineResult<()> {
        tracing::debug!(
            session_id = %ctx.session.id,
            event = %ctx.event,
            "Inbound event"
        );
        Ok(())
    }
}
