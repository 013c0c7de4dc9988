//! Test helpers for cross-crate scenarios.
//!
//! [`LocalTransport`] wires the client runtime straight to an in-process
//! engine over the memory backend, so end-to-end tests exercise the real
//! lifecycle, delivery, and reconnection paths without a network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tether_client::{
    ClientConfig, ClientEvent, ClientTransport, ConnectRequest, ConnectResponse, SessionClient,
    TransportError, TransportStream,
};
use tether_core::Envelope;
use tether_engine::{
    ConnectOptions, Engine, EngineConfig, EngineError, MessageOptions, ResumeOptions, RoutingTable,
    SessionHandle,
};
use tether_store::{MemoryStore, MessageQueue, RoomRegistry};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Client transport backed by a shared in-process engine.
pub struct LocalTransport {
    engine: Arc<Engine>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    streams_opened: AtomicUsize,
}

impl LocalTransport {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            forwarders: Mutex::new(Vec::new()),
            streams_opened: AtomicUsize::new(0),
        }
    }

    /// Kill every open stream without touching the sessions, the way a
    /// dropped network connection would.
    pub fn break_streams(&self) {
        for task in self.forwarders.lock().drain(..) {
            task.abort();
        }
    }

    /// Wait until at least `count` streams have been opened since the
    /// transport was created. Stream pumps open their streams from
    /// spawned tasks, so tests must rendezvous before publishing.
    pub async fn wait_for_streams(&self, count: usize) {
        while self.streams_opened.load(Ordering::SeqCst) < count {
            tokio::task::yield_now().await;
        }
    }
}

fn map_engine_err(err: EngineError) -> TransportError {
    match err {
        EngineError::SessionNotFound(_) => TransportError::SessionExpired,
        other => TransportError::RequestFailed(other.to_string()),
    }
}

#[async_trait]
impl ClientTransport for LocalTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse, TransportError> {
        let options = ConnectOptions {
            namespace: request.namespace,
            data: request.data,
            auth: request.auth,
            resume: request.resume.map(|resume| ResumeOptions {
                session_id: resume.session_id,
                watermark: resume.watermark,
            }),
        };
        let reply = self
            .engine
            .connect(options)
            .await
            .map_err(|err| TransportError::ConnectFailed(err.to_string()))?;
        Ok(ConnectResponse {
            session_id: reply.session_id,
            missed: reply.missed,
        })
    }

    async fn send(
        &self,
        session_id: &str,
        envelope: &Envelope,
    ) -> Result<Option<Value>, TransportError> {
        let options = MessageOptions {
            message_id: envelope.message_id.clone(),
            requires_ack: envelope.requires_ack.unwrap_or(false),
            compressed: envelope.is_compressed(),
        };
        self.engine
            .message(session_id, &envelope.event, envelope.data.clone(), options)
            .await
            .map_err(map_engine_err)
    }

    async fn disconnect(&self, session_id: &str) -> Result<(), TransportError> {
        self.engine.disconnect(session_id).await.map_err(map_engine_err)
    }

    async fn poll(&self, session_id: &str) -> Result<Vec<Envelope>, TransportError> {
        self.engine.poll(session_id).await.map_err(map_engine_err)
    }

    async fn open_stream(&self, session_id: &str) -> Result<TransportStream, TransportError> {
        let mut stream = self
            .engine
            .stream_subscribe(session_id)
            .await
            .map_err(map_engine_err)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            while let Some(envelope) = stream.recv().await {
                if tx.send(envelope).is_err() {
                    break;
                }
            }
        });
        let abort = forwarder.abort_handle();
        self.forwarders.lock().push(forwarder);
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        Ok(TransportStream::new(rx).with_close_hook(move || abort.abort()))
    }
}

/// One engine over one memory backend, shared by every client the
/// harness hands out.
pub struct TestHarness {
    pub engine: Arc<Engine>,
    backend: Arc<MemoryStore>,
    transport: Arc<LocalTransport>,
}

impl TestHarness {
    #[must_use]
    pub fn new(routing: RoutingTable) -> Self {
        Self::with_config(routing, EngineConfig::default())
    }

    #[must_use]
    pub fn with_config(routing: RoutingTable, config: EngineConfig) -> Self {
        let backend = Arc::new(MemoryStore::new());
        let engine = Arc::new(Engine::new(backend.clone(), routing, config));
        let transport = Arc::new(LocalTransport::new(engine.clone()));
        Self {
            engine,
            backend,
            transport,
        }
    }

    #[must_use]
    pub fn transport(&self) -> Arc<LocalTransport> {
        self.transport.clone()
    }

    #[must_use]
    pub fn client(&self) -> SessionClient {
        self.client_with(ClientConfig::default())
    }

    #[must_use]
    pub fn client_with(&self, config: ClientConfig) -> SessionClient {
        SessionClient::new(self.transport.clone(), config)
    }

    /// Server-side handle for emitting into a session out-of-band.
    pub async fn session(&self, session_id: &str) -> anyhow::Result<SessionHandle> {
        Ok(self.engine.session(session_id).await?)
    }

    /// Room index over the same backend, for asserting cleanup.
    #[must_use]
    pub fn rooms(&self) -> RoomRegistry {
        RoomRegistry::new(self.backend.clone())
    }

    /// Queue view over the same backend.
    #[must_use]
    pub fn queue(&self) -> MessageQueue {
        MessageQueue::new(self.backend.clone(), self.engine.config().session_ttl)
    }
}

/// Receive client events until a message envelope arrives.
pub async fn next_message(events: &mut broadcast::Receiver<ClientEvent>) -> Envelope {
    loop {
        match events.recv().await.expect("event stream closed") {
            ClientEvent::Message(envelope) => return envelope,
            _ => {}
        }
    }
}

/// Give in-flight deliveries time to land, then assert none of them was
/// a message for this receiver.
pub async fn assert_no_message(events: &mut broadcast::Receiver<ClientEvent>) {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    loop {
        match events.try_recv() {
            Ok(ClientEvent::Message(envelope)) => {
                panic!("unexpected message: {} {}", envelope.event, envelope.data)
            }
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Empty) => return,
            Err(err) => panic!("event stream broken: {err}"),
        }
    }
}
