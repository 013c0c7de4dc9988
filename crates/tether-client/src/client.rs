//! Client session runtime.
//!
//! [`SessionClient`] mirrors the server's session abstraction from the
//! caller's side: it owns the session ID, keeps delivery running over a
//! streaming or polling transport, replays missed messages after a
//! reconnect, suppresses duplicates by message ID, and mirrors the
//! server's acknowledgment pattern locally.
//!
//! Delivery failures never surface as errors from background tasks. The
//! pumps report stream loss to a supervisor task, which runs the backoff
//! loop and emits `reconnecting` / `connect_error` / `reconnect_failed`
//! events the application can subscribe to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tether_common::decompress_payload;
use tether_core::{events, now_ms, Envelope, PresenceChange};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::dedup::SeenSet;
use crate::error::{ClientError, ClientResult};
use crate::events::ClientEvent;
use crate::transport::{ClientTransport, ConnectRequest, ResumeRequest, TransportError};

const EVENT_BUFFER: usize = 256;
const CONTROL_BUFFER: usize = 32;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No session; `connect` has not run (or `disconnect` did).
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// Session established, delivery running.
    Connected,
    /// Delivery dropped; waiting out backoff before the next attempt.
    Reconnecting,
    /// Reconnect attempts exhausted. Only an explicit `connect` leaves
    /// this state.
    Failed,
}

/// How inbound messages reach the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Push delivery over an open stream.
    Streaming,
    /// Pull delivery by draining the durable queue on an interval.
    Polling,
}

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Namespace requested at connect.
    pub namespace: Option<String>,
    /// Bearer token forwarded in the connect handshake.
    pub auth: Option<String>,
    /// Initial session data sent at connect.
    pub data: HashMap<String, Value>,
    /// Delivery mode to start in.
    pub transport_mode: TransportMode,
    /// Ping cadence while connected.
    pub heartbeat_interval: Duration,
    /// Queue drain cadence in polling mode.
    pub poll_interval: Duration,
    /// How long an outbound ack waiter is kept before rejecting.
    pub ack_timeout: Duration,
    /// Cadence of the dedup-set maintenance task.
    pub dedup_trim_interval: Duration,
    /// Backoff policy for reconnect attempts.
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            auth: None,
            data: HashMap::new(),
            transport_mode: TransportMode::Streaming,
            heartbeat_interval: Duration::from_secs(25),
            poll_interval: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(5),
            dedup_trim_interval: Duration::from_secs(60),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_transport_mode(mut self, mode: TransportMode) -> Self {
        self.transport_mode = mode;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Commands the pumps and public API send to the supervisor.
#[derive(Debug)]
enum Control {
    /// Delivery died; the epoch identifies which generation of pumps
    /// reported it so stale reports are ignored.
    StreamLost(u64),
    /// Switch delivery mode, keeping the session.
    SetMode(TransportMode),
    Shutdown,
}

struct ClientInner {
    transport: Arc<dyn ClientTransport>,
    config: ClientConfig,
    state: Mutex<ClientState>,
    mode: Mutex<TransportMode>,
    session_id: Mutex<Option<String>>,
    /// Highest envelope timestamp observed; sent as the catch-up
    /// watermark on resume.
    watermark: AtomicI64,
    /// Bumped every time pumps are (re)started.
    epoch: AtomicU64,
    last_pong: AtomicI64,
    dedup: Mutex<SeenSet>,
    /// Outbound ack waiters keyed by local message ID.
    acks: DashMap<String, oneshot::Sender<Value>>,
    events_tx: broadcast::Sender<ClientEvent>,
    control_tx: Mutex<Option<mpsc::Sender<Control>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a logical session. Cheap to clone; all clones share one
/// session and one event stream.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<ClientInner>,
}

impl SessionClient {
    #[must_use]
    pub fn new(transport: Arc<dyn ClientTransport>, config: ClientConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let mode = config.transport_mode;
        Self {
            inner: Arc::new(ClientInner {
                transport,
                config,
                state: Mutex::new(ClientState::Idle),
                mode: Mutex::new(mode),
                session_id: Mutex::new(None),
                watermark: AtomicI64::new(0),
                epoch: AtomicU64::new(0),
                last_pong: AtomicI64::new(0),
                dedup: Mutex::new(SeenSet::new()),
                acks: DashMap::new(),
                events_tx,
                control_tx: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Establish a session. Replays any missed messages from a previous
    /// session before delivery starts, then runs the heartbeat and
    /// delivery pumps until `disconnect` or reconnect exhaustion.
    pub async fn connect(&self) -> ClientResult<String> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ClientState::Connecting | ClientState::Connected | ClientState::Reconnecting => {
                    return Err(ClientError::AlreadyConnected);
                }
                ClientState::Idle | ClientState::Failed => *state = ClientState::Connecting,
            }
        }
        self.inner.stop_tasks();

        let request = ConnectRequest {
            namespace: self.inner.config.namespace.clone(),
            data: self.inner.config.data.clone(),
            auth: self.inner.config.auth.clone(),
            resume: None,
        };
        let response = match self.inner.transport.connect(request).await {
            Ok(response) => response,
            Err(err) => {
                *self.inner.state.lock() = ClientState::Idle;
                warn!(error = %err, "Connect failed");
                self.inner
                    .emit_event(ClientEvent::ConnectError { reason: err.to_string() });
                return Err(err.into());
            }
        };

        let session_id = response.session_id.clone();
        *self.inner.session_id.lock() = Some(session_id.clone());
        *self.inner.state.lock() = ClientState::Connected;
        info!(session_id = %session_id, "Connected");
        self.inner.emit_event(ClientEvent::Connected {
            session_id: session_id.clone(),
            resumed: false,
        });
        for envelope in response.missed {
            self.inner.dispatch(envelope);
        }

        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
        *self.inner.control_tx.lock() = Some(control_tx.clone());
        self.inner.start_pumps(&control_tx);
        let supervisor = tokio::spawn(ClientInner::supervise(
            Arc::clone(&self.inner),
            control_rx,
            control_tx,
        ));
        *self.inner.supervisor.lock() = Some(supervisor);

        Ok(session_id)
    }

    /// End the session. Background tasks stop before the server is told,
    /// and the client returns to idle even when that request fails.
    pub async fn disconnect(&self) -> ClientResult<()> {
        if let Some(control_tx) = self.inner.control_tx.lock().take() {
            let _ = control_tx.try_send(Control::Shutdown);
        }
        self.inner.stop_tasks();
        if let Some(supervisor) = self.inner.supervisor.lock().take() {
            supervisor.abort();
        }
        let session_id = self.inner.session_id.lock().take();
        *self.inner.state.lock() = ClientState::Idle;

        let result = match session_id {
            Some(session_id) => {
                debug!(session_id = %session_id, "Disconnecting");
                self.inner
                    .transport
                    .disconnect(&session_id)
                    .await
                    .map_err(ClientError::from)
            }
            None => Ok(()),
        };
        self.inner.emit_event(ClientEvent::Disconnected);
        result
    }

    /// Send an event to the server.
    pub async fn emit(&self, event: impl Into<String>, data: Value) -> ClientResult<()> {
        let session_id = self.connected_session()?;
        let envelope = Envelope::new(event, data).with_session(&session_id);
        self.inner.transport.send(&session_id, &envelope).await?;
        Ok(())
    }

    /// Send an event and wait for the server's acknowledgment.
    ///
    /// Resolved by the direct response when the transport carries one
    /// inline, otherwise by the ack sentinel event; rejected with
    /// [`ClientError::AckTimeout`] after the configured timeout. Never
    /// both.
    pub async fn emit_with_ack(&self, event: impl Into<String>, data: Value) -> ClientResult<Value> {
        let session_id = self.connected_session()?;
        let message_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.acks.insert(message_id.clone(), tx);

        let envelope = Envelope::new(event, data)
            .with_session(&session_id)
            .with_ack_request(&message_id);
        match self.inner.transport.send(&session_id, &envelope).await {
            Ok(Some(reply)) => {
                self.inner.acks.remove(&message_id);
                return Ok(reply);
            }
            Ok(None) => {}
            Err(err) => {
                self.inner.acks.remove(&message_id);
                return Err(err.into());
            }
        }

        match tokio::time::timeout(self.inner.config.ack_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Elapsed, or the waiter was dropped by a disconnect.
            _ => {
                self.inner.acks.remove(&message_id);
                debug!(message_id = %message_id, "Ack timed out");
                Err(ClientError::AckTimeout { message_id })
            }
        }
    }

    /// Switch between streaming and polling delivery without losing the
    /// session. The old transport's resources are torn down first.
    pub async fn set_mode(&self, mode: TransportMode) -> ClientResult<()> {
        let control_tx = self.inner.control_tx.lock().clone();
        match control_tx {
            Some(tx) => tx
                .send(Control::SetMode(mode))
                .await
                .map_err(|_| ClientError::NotConnected),
            None => {
                // Not running; the mode applies at the next connect.
                *self.inner.mode.lock() = mode;
                Ok(())
            }
        }
    }

    /// Subscribe to the client's event stream.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events_tx.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.inner.state.lock()
    }

    #[must_use]
    pub fn mode(&self) -> TransportMode {
        *self.inner.mode.lock()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().clone()
    }

    /// Highest envelope timestamp seen so far.
    #[must_use]
    pub fn watermark(&self) -> i64 {
        self.inner.watermark.load(Ordering::Relaxed)
    }

    /// Unix-ms time of the last heartbeat reply, 0 before the first.
    #[must_use]
    pub fn last_pong_ms(&self) -> i64 {
        self.inner.last_pong.load(Ordering::Relaxed)
    }

    /// Number of unresolved outbound ack waiters.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.inner.acks.len()
    }

    fn connected_session(&self) -> ClientResult<String> {
        if *self.inner.state.lock() != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.inner
            .session_id
            .lock()
            .clone()
            .ok_or(ClientError::NotConnected)
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("state", &*self.inner.state.lock())
            .field("session_id", &*self.inner.session_id.lock())
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    fn emit_event(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    fn current_session(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// Route one inbound envelope: expand compression, advance the
    /// watermark, consume reserved events, auto-ack, dedup, surface.
    fn dispatch(self: &Arc<Self>, mut envelope: Envelope) {
        if let Some(timestamp) = envelope.timestamp {
            self.watermark.fetch_max(timestamp, Ordering::Relaxed);
        }

        if envelope.is_compressed() {
            match decompress_payload(&envelope.data) {
                Ok(Some(inflated)) => {
                    envelope.data = inflated;
                    envelope.compressed = None;
                }
                Ok(None) => {
                    warn!(event = %envelope.event, "Compressed flag without marker payload, dropping");
                    return;
                }
                Err(err) => {
                    warn!(event = %envelope.event, error = %err, "Payload expansion failed, dropping");
                    return;
                }
            }
        }

        match envelope.event.as_str() {
            events::EVENT_ACK => {
                self.resolve_ack(&envelope.data);
                return;
            }
            events::EVENT_PONG => {
                self.last_pong.store(now_ms(), Ordering::Relaxed);
                return;
            }
            events::EVENT_PRESENCE => {
                match serde_json::from_value::<PresenceChange>(envelope.data) {
                    Ok(change) => self.emit_event(ClientEvent::Presence(change)),
                    Err(err) => warn!(error = %err, "Malformed presence update, dropping"),
                }
                return;
            }
            other if events::is_reserved(other) => {
                debug!(event = %other, "Unhandled reserved event, dropping");
                return;
            }
            _ => {}
        }

        // Re-ack duplicates too: the sender retries until an ack lands.
        if envelope.wants_ack() {
            self.send_auto_ack(&envelope);
        }

        if let Some(message_id) = &envelope.message_id {
            if !self.dedup.lock().insert(message_id) {
                debug!(message_id = %message_id, "Duplicate suppressed");
                return;
            }
        }

        self.emit_event(ClientEvent::Message(envelope));
    }

    /// Settle a local ack waiter from the sentinel event's payload.
    fn resolve_ack(&self, data: &Value) {
        let Some(message_id) = data.get("messageId").and_then(Value::as_str) else {
            warn!("Ack without messageId, dropping");
            return;
        };
        match self.acks.remove(message_id) {
            Some((_, tx)) => {
                let reply = data.get("data").cloned().unwrap_or(Value::Null);
                let _ = tx.send(reply);
            }
            // Already settled by a direct response or a timeout.
            None => debug!(message_id = %message_id, "Ack for settled message"),
        }
    }

    fn send_auto_ack(self: &Arc<Self>, envelope: &Envelope) {
        let Some(message_id) = envelope.message_id.clone() else {
            return;
        };
        let Some(session_id) = self.current_session() else {
            return;
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let ack = Envelope::new(
                events::EVENT_ACK,
                json!({ "messageId": message_id, "data": Value::Null }),
            )
            .with_session(&session_id);
            if let Err(err) = inner.transport.send(&session_id, &ack).await {
                debug!(error = %err, "Auto-ack send failed");
            }
        });
    }

    /// Start the delivery pump for the current mode plus the heartbeat
    /// and dedup maintenance tasks, under a fresh epoch.
    fn start_pumps(self: &Arc<Self>, control_tx: &mpsc::Sender<Control>) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let mode = *self.mode.lock();
        let mut tasks = self.tasks.lock();

        let delivery = match mode {
            TransportMode::Streaming => tokio::spawn(Self::stream_pump(
                Arc::clone(self),
                control_tx.clone(),
                epoch,
            )),
            TransportMode::Polling => tokio::spawn(Self::poll_pump(
                Arc::clone(self),
                control_tx.clone(),
                epoch,
            )),
        };
        tasks.push(delivery);
        tasks.push(tokio::spawn(Self::heartbeat_pump(
            Arc::clone(self),
            control_tx.clone(),
            epoch,
        )));
        tasks.push(tokio::spawn(Self::dedup_trim_pump(Arc::clone(self))));
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Control loop owning reconnection. Runs until shutdown or
    /// reconnect exhaustion.
    async fn supervise(
        inner: Arc<Self>,
        mut control_rx: mpsc::Receiver<Control>,
        control_tx: mpsc::Sender<Control>,
    ) {
        while let Some(command) = control_rx.recv().await {
            match command {
                Control::StreamLost(epoch) => {
                    if epoch != inner.epoch.load(Ordering::SeqCst) {
                        debug!(epoch, "Stale stream-loss report, ignoring");
                        continue;
                    }
                    if !inner.reconnect(&control_tx).await {
                        break;
                    }
                }
                Control::SetMode(mode) => {
                    if *inner.mode.lock() == mode {
                        continue;
                    }
                    // Old transport resources go away before the new
                    // mode starts.
                    inner.stop_tasks();
                    *inner.mode.lock() = mode;
                    info!(?mode, "Switching transport mode");
                    inner.start_pumps(&control_tx);
                }
                Control::Shutdown => break,
            }
        }
        debug!("Client supervisor stopped");
    }

    /// Backoff loop. Returns false once attempts are exhausted and the
    /// client has entered the failed state.
    async fn reconnect(self: &Arc<Self>, control_tx: &mpsc::Sender<Control>) -> bool {
        self.stop_tasks();
        *self.state.lock() = ClientState::Reconnecting;

        let policy = &self.config.reconnect;
        let mut attempt: u32 = 0;
        while policy.should_retry(attempt) {
            attempt += 1;
            let delay = policy.delay(attempt);
            info!(attempt, ?delay, "Reconnecting");
            self.emit_event(ClientEvent::Reconnecting { attempt, delay });
            tokio::time::sleep(delay).await;

            *self.state.lock() = ClientState::Connecting;
            let resume = self.current_session().map(|session_id| ResumeRequest {
                session_id,
                watermark: self.watermark.load(Ordering::Relaxed),
            });
            let request = ConnectRequest {
                namespace: self.config.namespace.clone(),
                data: self.config.data.clone(),
                auth: self.config.auth.clone(),
                resume,
            };
            match self.transport.connect(request).await {
                Ok(response) => {
                    let session_id = response.session_id.clone();
                    *self.session_id.lock() = Some(session_id.clone());
                    *self.state.lock() = ClientState::Connected;
                    info!(session_id = %session_id, attempt, "Reconnected");
                    self.emit_event(ClientEvent::Connected {
                        session_id,
                        resumed: true,
                    });
                    // Replay lands before the new pumps so the dedup set
                    // already knows these IDs if the stream repeats them.
                    for envelope in response.missed {
                        self.dispatch(envelope);
                    }
                    self.start_pumps(control_tx);
                    return true;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "Reconnect attempt failed");
                    self.emit_event(ClientEvent::ConnectError {
                        reason: err.to_string(),
                    });
                    *self.state.lock() = ClientState::Reconnecting;
                }
            }
        }

        *self.state.lock() = ClientState::Failed;
        warn!(attempts = attempt, "Reconnect attempts exhausted");
        self.emit_event(ClientEvent::ReconnectFailed { attempts: attempt });
        false
    }

    /// Push delivery: forwards streamed envelopes until the stream ends.
    async fn stream_pump(inner: Arc<Self>, control_tx: mpsc::Sender<Control>, epoch: u64) {
        let Some(session_id) = inner.current_session() else {
            return;
        };
        let mut stream = match inner.transport.open_stream(&session_id).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Failed to open stream");
                let _ = control_tx.send(Control::StreamLost(epoch)).await;
                return;
            }
        };
        while let Some(envelope) = stream.recv().await {
            inner.dispatch(envelope);
        }
        debug!(session_id = %session_id, "Stream closed");
        let _ = control_tx.send(Control::StreamLost(epoch)).await;
    }

    /// Pull delivery: drains the durable queue on an interval.
    async fn poll_pump(inner: Arc<Self>, control_tx: mpsc::Sender<Control>, epoch: u64) {
        let Some(session_id) = inner.current_session() else {
            return;
        };
        let mut ticker = tokio::time::interval(inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match inner.transport.poll(&session_id).await {
                Ok(envelopes) => {
                    for envelope in envelopes {
                        inner.dispatch(envelope);
                    }
                }
                Err(TransportError::SessionExpired | TransportError::Closed) => {
                    warn!(session_id = %session_id, "Poll lost the session");
                    let _ = control_tx.send(Control::StreamLost(epoch)).await;
                    return;
                }
                Err(err) => warn!(error = %err, "Poll failed"),
            }
        }
    }

    async fn heartbeat_pump(inner: Arc<Self>, control_tx: mpsc::Sender<Control>, epoch: u64) {
        let Some(session_id) = inner.current_session() else {
            return;
        };
        let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The interval's first tick is immediate; the first ping waits a
        // full period.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let ping = Envelope::new(events::EVENT_PING, json!({})).with_session(&session_id);
            match inner.transport.send(&session_id, &ping).await {
                Ok(_) => {}
                Err(TransportError::SessionExpired | TransportError::Closed) => {
                    warn!(session_id = %session_id, "Heartbeat lost the session");
                    let _ = control_tx.send(Control::StreamLost(epoch)).await;
                    return;
                }
                Err(err) => warn!(error = %err, "Heartbeat ping failed"),
            }
        }
    }

    async fn dedup_trim_pump(inner: Arc<Self>) {
        let mut ticker = tokio::time::interval(inner.config.dedup_trim_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            inner.dedup.lock().enforce_limit();
        }
    }
}
