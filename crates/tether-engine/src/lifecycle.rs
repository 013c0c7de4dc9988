//! Connection lifecycle
//!
//! The [`Engine`] orchestrates the four transport-facing operations:
//! `connect`, `message`, `disconnect`, and the two delivery paths (`poll`
//! and `stream_subscribe`). Transport adapters map their own wire onto
//! these and nothing else.
//!
//! A session is live exactly as long as its record exists in the store;
//! TTL expiry and explicit disconnect are equivalent ends and no code here
//! assumes one ran before the other.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tether_common::decompress_payload;
use tether_core::{events, Envelope, PresenceStatus, SessionRecord, DEFAULT_NAMESPACE};
use tether_store::{Channel, PresenceStore, StoreBackend};
use tokio::sync::{mpsc, Notify};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::handle::{EngineShared, SessionHandle};
use crate::middleware::{ConnectContext, MessageContext};
use crate::presence::PresenceTracker;
use crate::routing::{HandlerContext, RoutingTable};

/// Options for [`Engine::connect`].
#[derive(Debug, Default)]
pub struct ConnectOptions {
    /// Namespace to join; defaults to `/`.
    pub namespace: Option<String>,
    /// Initial session data.
    pub data: HashMap<String, Value>,
    /// Bearer token for auth middleware.
    pub auth: Option<String>,
    /// Resume a previous session's backlog.
    pub resume: Option<ResumeOptions>,
}

/// Catch-up parameters for a reconnecting client.
#[derive(Debug, Clone)]
pub struct ResumeOptions {
    /// The session the client held before its transport dropped.
    pub session_id: String,
    /// Timestamp (ms) of the last message the client saw. Only backlog
    /// newer than this is replayed; untimestamped backlog always is.
    pub watermark: i64,
}

/// What a successful connect hands back to the transport.
#[derive(Debug)]
pub struct ConnectReply {
    pub session_id: String,
    pub session: SessionRecord,
    /// Backlog replayed from a resumed session, oldest first.
    pub missed: Vec<Envelope>,
}

/// Per-message flags from the wire envelope.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    pub message_id: Option<String>,
    pub requires_ack: bool,
    pub compressed: bool,
}

/// The session engine.
///
/// Owns the routing table, the presence tracker, and the background tasks
/// (presence sweeper, presence fan-out pump). Background tasks stop when
/// the engine is dropped.
pub struct Engine {
    shared: Arc<EngineShared>,
    routing: Arc<RoutingTable>,
    presence: Arc<PresenceTracker>,
    /// Sessions that asked for presence change notifications.
    watchers: Arc<DashMap<String, ()>>,
    /// Connect readiness gates, one per session awaiting its connect handler.
    ready_gates: Arc<DashMap<String, Arc<Notify>>>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
    presence_pump: Option<tokio::task::JoinHandle<()>>,
}

impl Engine {
    /// Build an engine over a store backend.
    pub fn new(backend: Arc<dyn StoreBackend>, routing: RoutingTable, config: EngineConfig) -> Self {
        let shared = Arc::new(EngineShared::new(Arc::clone(&backend), config.clone()));
        let presence_store = PresenceStore::new(backend, config.session_ttl);
        let presence = Arc::new(PresenceTracker::new(
            presence_store,
            config.away_after,
            config.offline_after,
        ));
        let watchers: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());

        let (sweeper, presence_pump) = if config.presence_enabled {
            let pump = Self::spawn_presence_pump(&presence, &shared, &watchers);
            let sweeper = Arc::clone(&presence).spawn_sweeper(config.sweep_interval);
            (Some(sweeper), Some(pump))
        } else {
            (None, None)
        };

        Self {
            shared,
            routing: Arc::new(routing),
            presence,
            watchers,
            ready_gates: Arc::new(DashMap::new()),
            sweeper,
            presence_pump,
        }
    }

    /// Create a session: record first, then middleware (which can roll it
    /// back), then resume catch-up, then presence. The connect handler runs
    /// separately once the client signals readiness.
    pub async fn connect(&self, options: ConnectOptions) -> EngineResult<ConnectReply> {
        let ConnectOptions { namespace, data, auth, resume } = options;

        let session_id = uuid::Uuid::new_v4().to_string();
        let namespace = namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let mut record = SessionRecord::new(&session_id, &namespace);
        for (key, value) in data {
            record.set(key, value);
        }
        self.shared.sessions.create(&record).await?;

        let ctx = ConnectContext {
            session: &record,
            auth: auth.as_deref(),
        };
        for middleware in self.routing.middleware() {
            if let Err(e) = middleware.on_connect(&ctx).await {
                tracing::warn!(
                    session_id = %session_id,
                    middleware = middleware.name(),
                    error = %e,
                    "Connect rejected"
                );
                self.shared.sessions.delete(&session_id).await?;
                return Err(e);
            }
        }

        let mut missed = Vec::new();
        if let Some(resume) = &resume {
            let backlog = self.shared.queue.drain(&resume.session_id).await?;
            missed = backlog
                .into_iter()
                .filter(|envelope| envelope.timestamp.is_none_or(|t| t > resume.watermark))
                .collect();
            tracing::info!(
                session_id = %session_id,
                resumed_from = %resume.session_id,
                missed = missed.len(),
                "Session resumed"
            );
        }

        if self.shared.config.presence_enabled {
            let user_id = record
                .get("userId")
                .and_then(Value::as_str)
                .map_or_else(|| session_id.clone(), str::to_string);
            self.presence
                .track(&session_id, &user_id, PresenceStatus::Online)
                .await?;
        }

        self.arm_connect_handler(&session_id, &namespace);

        tracing::info!(session_id = %session_id, namespace = %namespace, "Session connected");
        Ok(ConnectReply {
            session_id,
            session: record,
            missed,
        })
    }

    /// Dispatch one inbound event.
    ///
    /// Reserved session-layer events are handled here and never reach
    /// application handlers. Events with no matching handler are logged
    /// and dropped, not errors. The returned value is the handler's reply,
    /// which doubles as the ack payload when the sender asked for one.
    pub async fn message(
        &self,
        session_id: &str,
        event: &str,
        data: Value,
        options: MessageOptions,
    ) -> EngineResult<Option<Value>> {
        // Any inbound traffic proves the client is reachable.
        self.mark_ready(session_id);

        let Some(record) = self.shared.sessions.get(session_id).await? else {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        };

        let ctx = MessageContext {
            session: &record,
            event,
            data: &data,
        };
        for middleware in self.routing.middleware() {
            middleware.on_message(&ctx).await?;
        }

        // The compression marker is self-describing; the envelope flag is
        // only checked for consistency.
        let data = match decompress_payload(&data)? {
            Some(inflated) => inflated,
            None if options.compressed => {
                return Err(EngineError::ValidationFailed(
                    "compressed flag without compressed payload".to_string(),
                ));
            }
            None => data,
        };

        // Sliding TTL: activity keeps the session alive.
        self.shared.sessions.touch(session_id).await?;

        if events::is_reserved(event) {
            return self.dispatch_reserved(&record, event, data).await;
        }

        let Some(handler) = self.routing.resolve(&record.namespace, event) else {
            tracing::debug!(session_id = %session_id, event = %event, "Unrouted event dropped");
            return Ok(None);
        };

        let handle = SessionHandle::new(record, Arc::clone(&self.shared));
        let reply = handler(HandlerContext {
            handle,
            event: event.to_string(),
            data,
        })
        .await
        .map_err(EngineError::Handler)?;

        if options.requires_ack {
            if let Some(message_id) = &options.message_id {
                self.publish_ack(session_id, message_id, reply.clone()).await?;
            }
        }
        Ok(reply)
    }

    /// Tear a session down.
    ///
    /// No-op when the session is already gone (TTL expiry counts as a
    /// disconnect). Every cleanup step runs even when an earlier one
    /// fails; the first failure is returned after cleanup completes.
    pub async fn disconnect(&self, session_id: &str) -> EngineResult<()> {
        let Some(record) = self.shared.sessions.get(session_id).await? else {
            tracing::debug!(session_id = %session_id, "Disconnect for absent session");
            return Ok(());
        };

        self.ready_gates.remove(session_id);
        self.watchers.remove(session_id);

        let mut first_error: Option<EngineError> = None;
        if let Some(handler) = self.routing.disconnect_handler(&record.namespace) {
            let handle = SessionHandle::new(record, Arc::clone(&self.shared));
            if let Err(e) = handler(handle).await {
                tracing::warn!(session_id = %session_id, error = %e, "Disconnect handler failed");
                first_error = Some(EngineError::Handler(e));
            }
        }

        if let Err(e) = self.shared.rooms.leave_all(session_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "Room cleanup failed");
            first_error.get_or_insert(EngineError::Store(e));
        }
        if self.shared.config.presence_enabled {
            if let Err(e) = self.presence.untrack(session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "Presence cleanup failed");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.shared.sessions.delete(session_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "Session delete failed");
            first_error.get_or_insert(EngineError::Store(e));
        }

        tracing::info!(session_id = %session_id, "Session disconnected");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drain the session's durable queue (pull delivery).
    pub async fn poll(&self, session_id: &str) -> EngineResult<Vec<Envelope>> {
        if self.shared.sessions.get(session_id).await?.is_none() {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        }
        self.shared.sessions.touch(session_id).await?;
        let drained = self.shared.queue.drain(session_id).await?;
        self.mark_ready(session_id);
        Ok(drained)
    }

    /// Open the push delivery path: the session's own channel plus its
    /// namespace broadcast channel, merged into one stream.
    ///
    /// The session's own broadcasts are filtered out by sender ID. The
    /// stream closing (drop) releases both subscriptions.
    pub async fn stream_subscribe(&self, session_id: &str) -> EngineResult<MessageStream> {
        let Some(record) = self.shared.sessions.get(session_id).await? else {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        };

        let mut own = self
            .shared
            .queue
            .subscribe(&Channel::session(session_id))
            .await?;
        let mut broadcast = self
            .shared
            .queue
            .subscribe(&Channel::broadcast(&record.namespace))
            .await?;

        // Both subscriptions are live; the client can be reached now.
        self.mark_ready(session_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let sid = session_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                let (raw, from_broadcast) = tokio::select! {
                    msg = own.recv() => match msg {
                        Some(raw) => (raw, false),
                        None => break,
                    },
                    msg = broadcast.recv() => match msg {
                        Some(raw) => (raw, true),
                        None => break,
                    },
                };
                match Envelope::from_json(&raw) {
                    Ok(envelope) => {
                        if from_broadcast && envelope.session_id.as_deref() == Some(sid.as_str()) {
                            continue;
                        }
                        if tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %sid, error = %e, "Malformed envelope skipped");
                    }
                }
            }
        });

        Ok(MessageStream { rx, task })
    }

    /// Handle for a live session, for server-initiated sends outside any
    /// handler.
    pub async fn session(&self, session_id: &str) -> EngineResult<SessionHandle> {
        let Some(record) = self.shared.sessions.get(session_id).await? else {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        };
        Ok(SessionHandle::new(record, Arc::clone(&self.shared)))
    }

    /// The presence tracker, for app-level queries.
    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Reserved event dispatch. Returning `Some` means the transport
    /// should reply with that payload inline.
    async fn dispatch_reserved(
        &self,
        record: &SessionRecord,
        event: &str,
        data: Value,
    ) -> EngineResult<Option<Value>> {
        match event {
            events::EVENT_PING => {
                if self.shared.config.presence_enabled {
                    self.presence.heartbeat(&record.id).await?;
                }
                let pong = json!({ "timestamp": tether_core::now_ms() });
                let envelope = Envelope::new(events::EVENT_PONG, pong.clone())
                    .with_session(&record.id)
                    .volatile();
                self.shared
                    .queue
                    .publish(&Channel::session(&record.id), &envelope)
                    .await?;
                Ok(Some(pong))
            }
            // Client answered a server ping; the touch already happened.
            events::EVENT_PONG => Ok(None),
            events::EVENT_ACK => {
                let Some(message_id) = data.get("messageId").and_then(Value::as_str) else {
                    return Err(EngineError::ValidationFailed(
                        "ack without messageId".to_string(),
                    ));
                };
                let payload = data.get("data").cloned().unwrap_or(Value::Null);
                if !self.shared.acks.resolve(message_id, payload) {
                    tracing::debug!(message_id = %message_id, "Ack for unknown message");
                }
                Ok(None)
            }
            events::EVENT_PRESENCE => {
                if self.shared.config.presence_enabled {
                    let status = data
                        .get("status")
                        .and_then(Value::as_str)
                        .and_then(|raw| raw.parse::<PresenceStatus>().ok());
                    let Some(status) = status else {
                        return Err(EngineError::ValidationFailed(
                            "presence without a valid status".to_string(),
                        ));
                    };
                    self.presence.set_status(&record.id, status).await?;
                }
                Ok(None)
            }
            events::EVENT_PRESENCE_SUBSCRIBE => {
                self.watchers.insert(record.id.clone(), ());
                let snapshot = serde_json::to_value(self.presence.snapshot())?;
                Ok(Some(snapshot))
            }
            events::EVENT_PRESENCE_UNSUBSCRIBE => {
                self.watchers.remove(&record.id);
                Ok(None)
            }
            _ => {
                tracing::debug!(event = %event, "Unknown reserved event dropped");
                Ok(None)
            }
        }
    }

    /// Publish the ack for a handled message on the sender's channel.
    async fn publish_ack(
        &self,
        session_id: &str,
        message_id: &str,
        reply: Option<Value>,
    ) -> EngineResult<()> {
        let ack = json!({
            "messageId": message_id,
            "data": reply.unwrap_or(Value::Null),
        });
        let envelope = Envelope::new(events::EVENT_ACK, ack)
            .with_session(session_id)
            .volatile();
        self.shared
            .queue
            .publish(&Channel::session(session_id), &envelope)
            .await?;
        Ok(())
    }

    /// Park the connect handler behind a readiness gate.
    ///
    /// The handler fires when the client first subscribes, polls, or
    /// sends, or after `ready_timeout` as a fallback, whichever comes
    /// first. Emits from inside the handler therefore have somewhere to
    /// land instead of racing a client that is still setting up.
    fn arm_connect_handler(&self, session_id: &str, namespace: &str) {
        let Some(handler) = self.routing.connect_handler(namespace) else {
            return;
        };

        let gate = Arc::new(Notify::new());
        self.ready_gates
            .insert(session_id.to_string(), Arc::clone(&gate));

        let shared = Arc::clone(&self.shared);
        let gates = Arc::clone(&self.ready_gates);
        let ready_timeout = self.shared.config.ready_timeout;
        let sid = session_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = gate.notified() => {}
                () = tokio::time::sleep(ready_timeout) => {
                    tracing::debug!(session_id = %sid, "Ready timeout elapsed; running connect handler");
                }
            }
            gates.remove(&sid);

            // The session may have ended while we waited.
            match shared.sessions.get(&sid).await {
                Ok(Some(record)) => {
                    let handle = SessionHandle::new(record, Arc::clone(&shared));
                    if let Err(e) = handler(handle).await {
                        tracing::warn!(session_id = %sid, error = %e, "Connect handler failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(session_id = %sid, error = %e, "Connect handler skipped");
                }
            }
        });
    }

    fn mark_ready(&self, session_id: &str) {
        if let Some(gate) = self.ready_gates.get(session_id) {
            gate.notify_one();
        }
    }

    /// Forward presence changes to every watching session as volatile
    /// reserved events.
    fn spawn_presence_pump(
        presence: &Arc<PresenceTracker>,
        shared: &Arc<EngineShared>,
        watchers: &Arc<DashMap<String, ()>>,
    ) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        presence.add_listener(move |change| {
            let _ = tx.send(change.clone());
        });

        let shared = Arc::clone(shared);
        let watchers = Arc::clone(watchers);
        tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                let data = match serde_json::to_value(&change) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!(error = %e, "Presence change unserializable");
                        continue;
                    }
                };
                let envelope = Envelope::new(events::EVENT_PRESENCE, data).volatile();
                let targets: Vec<String> = watchers.iter().map(|e| e.key().clone()).collect();
                for session_id in targets {
                    if let Err(e) = shared
                        .queue
                        .publish(&Channel::session(&session_id), &envelope)
                        .await
                    {
                        tracing::warn!(session_id = %session_id, error = %e, "Presence fan-out failed");
                    }
                }
            }
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.take() {
            task.abort();
        }
        if let Some(task) = self.presence_pump.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("watchers", &self.watchers.len())
            .field("ready_gates", &self.ready_gates.len())
            .finish_non_exhaustive()
    }
}

/// Merged push stream for one session.
///
/// Dropping it aborts the merge task, which releases the underlying
/// channel subscriptions.
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<Envelope>,
    task: tokio::task::JoinHandle<()>,
}

impl MessageStream {
    /// Next envelope, or `None` once the stream has closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Middleware;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tether_store::{MemoryStore, MessageQueue, RoomRegistry};

    fn engine(routing: RoutingTable) -> Engine {
        Engine::new(Arc::new(MemoryStore::new()), routing, EngineConfig::default())
    }

    fn connect_data(user_id: &str) -> HashMap<String, Value> {
        HashMap::from([("userId".to_string(), json!(user_id))])
    }

    /// Middleware that records the session it saw, then rejects it.
    struct RecordingReject {
        seen: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl Middleware for RecordingReject {
        fn name(&self) -> &str {
            "recording-reject"
        }

        async fn on_connect(&self, ctx: &ConnectContext<'_>) -> EngineResult<()> {
            *self.seen.lock() = Some(ctx.session.id.clone());
            Err(EngineError::AuthenticationFailed("rejected".to_string()))
        }
    }

    #[tokio::test]
    async fn test_connect_creates_live_session() {
        let engine = engine(RoutingTable::builder().build());

        let reply = engine.connect(ConnectOptions::default()).await.unwrap();
        assert!(!reply.session_id.is_empty());
        assert_eq!(reply.session.namespace, "/");
        assert!(reply.missed.is_empty());

        // The session is live: poll succeeds and is empty.
        assert!(engine.poll(&reply.session_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_rolls_back_on_middleware_rejection() {
        let seen = Arc::new(Mutex::new(None));
        let routing = RoutingTable::builder()
            .with_middleware(RecordingReject { seen: Arc::clone(&seen) })
            .build();
        let engine = engine(routing);

        let err = engine.connect(ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::AuthenticationFailed(_)));

        // The record created before the middleware ran is gone again.
        let session_id = seen.lock().clone().unwrap();
        assert!(matches!(
            engine.poll(&session_id).await,
            Err(EngineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_message_routes_and_replies() {
        let routing = RoutingTable::builder()
            .on("echo", |ctx| async move { Ok(Some(ctx.data)) })
            .build();
        let engine = engine(routing);
        let reply = engine.connect(ConnectOptions::default()).await.unwrap();

        let out = engine
            .message(&reply.session_id, "echo", json!({"x": 1}), MessageOptions::default())
            .await
            .unwrap();
        assert_eq!(out, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_message_requires_live_session() {
        let engine = engine(RoutingTable::builder().build());
        let err = engine
            .message("ghost", "echo", json!({}), MessageOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_unrouted_event_is_dropped() {
        let engine = engine(RoutingTable::builder().build());
        let reply = engine.connect(ConnectOptions::default()).await.unwrap();

        let out = engine
            .message(&reply.session_id, "nobody-home", json!({}), MessageOptions::default())
            .await
            .unwrap();
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let routing = RoutingTable::builder()
            .on("boom", |_ctx| async { anyhow::bail!("exploded") })
            .build();
        let engine = engine(routing);
        let reply = engine.connect(ConnectOptions::default()).await.unwrap();

        let err = engine
            .message(&reply.session_id, "boom", json!({}), MessageOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "HANDLER_ERROR");
    }

    #[tokio::test]
    async fn test_ping_answers_pong_and_tracks_presence() {
        let engine = engine(RoutingTable::builder().build());
        let reply = engine
            .connect(ConnectOptions { data: connect_data("alice"), ..Default::default() })
            .await
            .unwrap();

        let pong = engine
            .message(&reply.session_id, events::EVENT_PING, json!({}), MessageOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert!(pong["timestamp"].is_i64());

        assert_eq!(
            engine.presence().status_of("alice"),
            Some(PresenceStatus::Online)
        );
    }

    #[tokio::test]
    async fn test_ack_event_resolves_waiter() {
        let engine = engine(RoutingTable::builder().build());
        let reply = engine.connect(ConnectOptions::default()).await.unwrap();
        let sid = reply.session_id;

        let handle = engine.session(&sid).await.unwrap();
        let waiter = handle.emit_with_ack("save", json!({"doc": 7})).await.unwrap();

        let delivered = engine.poll(&sid).await.unwrap();
        assert_eq!(delivered.len(), 1);
        let message_id = delivered[0].message_id.clone().unwrap();

        engine
            .message(
                &sid,
                events::EVENT_ACK,
                json!({"messageId": message_id, "data": {"saved": true}}),
                MessageOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(waiter.wait().await.unwrap(), json!({"saved": true}));
    }

    #[tokio::test]
    async fn test_message_acks_back_to_sender() {
        let routing = RoutingTable::builder()
            .on("save", |_ctx| async { Ok(Some(json!({"ok": true}))) })
            .build();
        let engine = engine(routing);
        let reply = engine.connect(ConnectOptions::default()).await.unwrap();
        let sid = reply.session_id;

        let mut stream = engine.stream_subscribe(&sid).await.unwrap();
        let options = MessageOptions {
            message_id: Some("m-1".to_string()),
            requires_ack: true,
            compressed: false,
        };
        let out = engine.message(&sid, "save", json!({}), options).await.unwrap();
        assert_eq!(out, Some(json!({"ok": true})));

        let ack = stream.recv().await.unwrap();
        assert_eq!(ack.event, events::EVENT_ACK);
        assert_eq!(ack.data["messageId"], "m-1");
        assert_eq!(ack.data["data"], json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_despite_handler_failure() {
        let backend = Arc::new(MemoryStore::new());
        let routing = RoutingTable::builder()
            .on_disconnect(|_handle| async { anyhow::bail!("handler down") })
            .build();
        let engine = Engine::new(backend.clone(), routing, EngineConfig::default());

        let reply = engine.connect(ConnectOptions::default()).await.unwrap();
        let sid = reply.session_id;
        engine.session(&sid).await.unwrap().join("lobby").await.unwrap();

        let err = engine.disconnect(&sid).await.unwrap_err();
        assert_eq!(err.error_code(), "HANDLER_ERROR");

        // Cleanup ran anyway: session gone, membership gone.
        assert!(matches!(engine.poll(&sid).await, Err(EngineError::SessionNotFound(_))));
        let rooms = RoomRegistry::new(backend);
        assert!(rooms.members_of("lobby").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_absent_session_is_noop() {
        let engine = engine(RoutingTable::builder().build());
        engine.disconnect("long-gone").await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_replays_backlog_exactly_once() {
        let engine = engine(RoutingTable::builder().build());
        let old = engine.connect(ConnectOptions::default()).await.unwrap();
        let watermark = tether_core::now_ms() - 1_000;

        let handle = engine.session(&old.session_id).await.unwrap();
        for n in 1..=3 {
            handle.emit("update", json!({"n": n})).await.unwrap();
        }

        let resumed = engine
            .connect(ConnectOptions {
                resume: Some(ResumeOptions {
                    session_id: old.session_id.clone(),
                    watermark,
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        let ns: Vec<i64> = resumed
            .missed
            .iter()
            .map(|envelope| envelope.data["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![1, 2, 3]);

        // Replay drained the old queue; nothing is delivered twice.
        assert!(engine.poll(&old.session_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_filters_by_watermark() {
        let backend = Arc::new(MemoryStore::new());
        let engine = Engine::new(backend.clone(), RoutingTable::builder().build(), EngineConfig::default());

        // Backlog with controlled timestamps, enqueued out of band.
        let queue = MessageQueue::new(backend, Duration::from_secs(3600));
        let mut early = Envelope::new("update", json!({"n": 1}));
        early.timestamp = Some(100);
        let mut late = Envelope::new("update", json!({"n": 2}));
        late.timestamp = Some(200);
        queue.enqueue("stale", &early).await.unwrap();
        queue.enqueue("stale", &late).await.unwrap();

        let resumed = engine
            .connect(ConnectOptions {
                resume: Some(ResumeOptions { session_id: "stale".to_string(), watermark: 150 }),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(resumed.missed.len(), 1);
        assert_eq!(resumed.missed[0].data["n"], 2);
    }

    #[tokio::test]
    async fn test_stream_filters_own_broadcast() {
        let engine = engine(RoutingTable::builder().build());
        let a = engine.connect(ConnectOptions::default()).await.unwrap();
        let b = engine.connect(ConnectOptions::default()).await.unwrap();

        let mut stream_a = engine.stream_subscribe(&a.session_id).await.unwrap();
        let mut stream_b = engine.stream_subscribe(&b.session_id).await.unwrap();

        let handle_a = engine.session(&a.session_id).await.unwrap();
        handle_a.broadcast("announce", json!({"v": 1})).await.unwrap();

        let seen = stream_b.recv().await.unwrap();
        assert_eq!(seen.event, "announce");
        assert_eq!(seen.session_id.as_deref(), Some(a.session_id.as_str()));

        // The sender's own stream drops its broadcast.
        tokio::task::yield_now().await;
        assert!(stream_a.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_handler_waits_for_readiness() {
        let backend = Arc::new(MemoryStore::new());
        let routing = RoutingTable::builder()
            .on_connect(|handle| async move {
                handle.emit("welcome", json!({})).await?;
                Ok(())
            })
            .build();
        let engine = Engine::new(backend.clone(), routing, EngineConfig::default());

        let reply = engine.connect(ConnectOptions::default()).await.unwrap();
        let sid = reply.session_id;

        // Client has not shown up yet: no welcome emitted.
        let queue = MessageQueue::new(backend, Duration::from_secs(3600));
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.len(&sid).await.unwrap(), 0);

        // First poll signals readiness; the handler fires after it.
        assert!(engine.poll(&sid).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let welcomed = queue.drain(&sid).await.unwrap();
        assert_eq!(welcomed.len(), 1);
        assert_eq!(welcomed[0].event, "welcome");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_handler_fires_on_ready_timeout() {
        let backend = Arc::new(MemoryStore::new());
        let routing = RoutingTable::builder()
            .on_connect(|handle| async move {
                handle.emit("welcome", json!({})).await?;
                Ok(())
            })
            .build();
        let config = EngineConfig::default().with_ready_timeout(Duration::from_secs(1));
        let engine = Engine::new(backend.clone(), routing, config);

        let reply = engine.connect(ConnectOptions::default()).await.unwrap();

        // No poll, no stream, no message: the fallback fires.
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let queue = MessageQueue::new(backend, Duration::from_secs(3600));
        assert_eq!(queue.len(&reply.session_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_presence_subscription_snapshot_and_pushes() {
        let engine = engine(RoutingTable::builder().build());
        let a = engine
            .connect(ConnectOptions { data: connect_data("alice"), ..Default::default() })
            .await
            .unwrap();

        // Let the presence pump drain alice's own online change before she
        // starts watching.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let mut stream = engine.stream_subscribe(&a.session_id).await.unwrap();
        let snapshot = engine
            .message(
                &a.session_id,
                events::EVENT_PRESENCE_SUBSCRIBE,
                json!({}),
                MessageOptions::default(),
            )
            .await
            .unwrap()
            .unwrap();
        let users: Vec<&str> = snapshot
            .as_array()
            .unwrap()
            .iter()
            .map(|record| record["user_id"].as_str().unwrap())
            .collect();
        assert_eq!(users, vec!["alice"]);

        // A new user coming online is pushed to the watcher.
        engine
            .connect(ConnectOptions { data: connect_data("bob"), ..Default::default() })
            .await
            .unwrap();

        let change = stream.recv().await.unwrap();
        assert_eq!(change.event, events::EVENT_PRESENCE);
        assert_eq!(change.data["user_id"], "bob");
        assert_eq!(change.data["status"], "online");
        assert!(change.is_volatile());
    }

    #[tokio::test]
    async fn test_compressed_inbound_payload_is_inflated() {
        let routing = RoutingTable::builder()
            .on("blob", |ctx| async move { Ok(Some(ctx.data)) })
            .build();
        let engine = engine(routing);
        let reply = engine.connect(ConnectOptions::default()).await.unwrap();

        let original = json!({"text": "y".repeat(2048)});
        let (wrapped, compressed) = tether_common::maybe_compress(&original, 1).unwrap();
        assert!(compressed);

        let options = MessageOptions { compressed: true, ..Default::default() };
        let out = engine
            .message(&reply.session_id, "blob", wrapped, options)
            .await
            .unwrap();
        assert_eq!(out, Some(original));

        // A compressed flag without the marker is a protocol violation.
        let options = MessageOptions { compressed: true, ..Default::default() };
        let err = engine
            .message(&reply.session_id, "blob", json!({"plain": 1}), options)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));
    }
}
