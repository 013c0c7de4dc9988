//! Session handle
//!
//! The object handed to application event handlers. One handle wraps one
//! session and composes the session store, the durable queue, and the room
//! registry into the delivery API: `emit` (durable), `emit_volatile`
//! (channel only), `broadcast` (namespace channel), and room fan-out.

use std::sync::Arc;

use serde_json::Value;
use tether_common::maybe_compress;
use tether_core::{Envelope, SessionRecord};
use tether_store::{
    Channel, MessageQueue, RoomRegistry, SessionStore, StoreBackend,
};

use crate::acks::{AckHandle, AckRegistry};
use crate::config::EngineConfig;
use crate::error::EngineResult;

/// State shared by every handle and the engine itself.
pub(crate) struct EngineShared {
    pub(crate) sessions: SessionStore,
    pub(crate) queue: MessageQueue,
    pub(crate) rooms: RoomRegistry,
    pub(crate) acks: AckRegistry,
    pub(crate) config: EngineConfig,
}

impl EngineShared {
    pub(crate) fn new(backend: Arc<dyn StoreBackend>, config: EngineConfig) -> Self {
        Self {
            sessions: SessionStore::new(Arc::clone(&backend), config.session_ttl),
            queue: MessageQueue::new(Arc::clone(&backend), config.session_ttl)
                .with_max_len(config.max_queue_len),
            rooms: RoomRegistry::new(backend),
            acks: AckRegistry::new(config.ack_timeout),
            config,
        }
    }
}

/// Options for room fan-out.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOptions {
    /// Deliver to the sender as well.
    pub include_self: bool,
    /// Skip the durable queue; members not subscribed right now miss it.
    pub volatile: bool,
}

/// Per-session facade over the shared stores.
///
/// Cheap to clone; the engine builds a fresh one for every dispatched event
/// from the session record it just loaded.
#[derive(Clone)]
pub struct SessionHandle {
    session: SessionRecord,
    shared: Arc<EngineShared>,
}

impl SessionHandle {
    pub(crate) fn new(session: SessionRecord, shared: Arc<EngineShared>) -> Self {
        Self { session, shared }
    }

    /// Session ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.session.id
    }

    /// Namespace this session connected under.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.session.namespace
    }

    /// The session record as loaded for this dispatch.
    #[must_use]
    pub fn session(&self) -> &SessionRecord {
        &self.session
    }

    /// Read a value from the session data bag.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.session.get(key)
    }

    /// Write a value into the session data bag and persist it.
    ///
    /// The write is durable once this returns. A concurrently expired
    /// session drops the write; that is logged, not an error.
    pub async fn set(&mut self, key: impl Into<String>, value: Value) -> EngineResult<()> {
        let key = key.into();
        self.session.set(key.clone(), value.clone());
        let stored = self
            .shared
            .sessions
            .update(&self.session.id, move |record| {
                record.set(key, value);
            })
            .await?;
        if !stored {
            tracing::debug!(session_id = %self.session.id, "Data write dropped: session gone");
        }
        Ok(())
    }

    /// Remove a key from the session data bag and persist the removal.
    pub async fn remove(&mut self, key: &str) -> EngineResult<()> {
        self.session.remove(key);
        let key = key.to_string();
        self.shared
            .sessions
            .update(&self.session.id, move |record| {
                record.remove(&key);
            })
            .await?;
        Ok(())
    }

    /// Durable send to this session: enqueue, then publish.
    ///
    /// Enqueue-then-publish is deliberate: the queue is the guarantee, the
    /// channel is the fast path. The two are not atomic.
    pub async fn emit(&self, event: impl Into<String>, data: Value) -> EngineResult<()> {
        let envelope = self.sealed(event.into(), data)?;
        self.shared.queue.enqueue(self.id(), &envelope).await?;
        self.shared
            .queue
            .publish(&Channel::session(self.id()), &envelope)
            .await?;
        Ok(())
    }

    /// Durable send that waits for the receiver to acknowledge.
    ///
    /// The waiter is registered before the message leaves, so an ack cannot
    /// arrive before anyone is listening for it.
    pub async fn emit_with_ack(
        &self,
        event: impl Into<String>,
        data: Value,
    ) -> EngineResult<AckHandle> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let envelope = self
            .sealed(event.into(), data)?
            .with_ack_request(message_id.clone());

        let handle = self.shared.acks.register(&message_id);
        self.shared.queue.enqueue(self.id(), &envelope).await?;
        self.shared
            .queue
            .publish(&Channel::session(self.id()), &envelope)
            .await?;
        Ok(handle)
    }

    /// Channel-only send: no queue, gone if nobody is subscribed.
    ///
    /// For data where staleness beats backlog (cursor positions, typing
    /// indicators). Returns how many subscribers saw it.
    pub async fn emit_volatile(
        &self,
        event: impl Into<String>,
        data: Value,
    ) -> EngineResult<usize> {
        let envelope = self.sealed(event.into(), data)?.volatile();
        let delivered = self
            .shared
            .queue
            .publish(&Channel::session(self.id()), &envelope)
            .await?;
        Ok(delivered)
    }

    /// Publish to this session's namespace broadcast channel.
    ///
    /// Never enqueued: recipients not subscribed at publish time miss it.
    /// Subscribers drop their own broadcasts by sender ID, so the returned
    /// count includes the sender's subscription when it has one.
    pub async fn broadcast(&self, event: impl Into<String>, data: Value) -> EngineResult<usize> {
        let envelope = self
            .sealed(event.into(), data)?
            .with_namespace(self.namespace());
        let delivered = self
            .shared
            .queue
            .publish(&Channel::broadcast(self.namespace()), &envelope)
            .await?;
        Ok(delivered)
    }

    /// Namespace broadcast flagged volatile, so receivers treat it as
    /// drop-on-miss data.
    pub async fn broadcast_volatile(
        &self,
        event: impl Into<String>,
        data: Value,
    ) -> EngineResult<usize> {
        let envelope = self
            .sealed(event.into(), data)?
            .with_namespace(self.namespace())
            .volatile();
        let delivered = self
            .shared
            .queue
            .publish(&Channel::broadcast(self.namespace()), &envelope)
            .await?;
        Ok(delivered)
    }

    /// Durable fan-out to a room, excluding the sender.
    pub async fn broadcast_to_room(
        &self,
        room: &str,
        event: impl Into<String>,
        data: Value,
    ) -> EngineResult<usize> {
        self.broadcast_to_room_with(room, event, data, BroadcastOptions::default())
            .await
    }

    /// Room fan-out that skips the durable queue: only members subscribed
    /// right now see it.
    pub async fn broadcast_to_room_volatile(
        &self,
        room: &str,
        event: impl Into<String>,
        data: Value,
    ) -> EngineResult<usize> {
        let options = BroadcastOptions { volatile: true, ..Default::default() };
        self.broadcast_to_room_with(room, event, data, options).await
    }

    /// Fan-out to a room with explicit options.
    ///
    /// Members are delivered to in parallel; one member's failure never
    /// blocks the rest and partial fan-out is not rolled back. Members
    /// whose session record has expired are pruned from the room instead
    /// of delivered to. Returns the number of members reached.
    pub async fn broadcast_to_room_with(
        &self,
        room: &str,
        event: impl Into<String>,
        data: Value,
        options: BroadcastOptions,
    ) -> EngineResult<usize> {
        let mut envelope = self.sealed(event.into(), data)?;
        if options.volatile {
            envelope = envelope.volatile();
        }

        let members = self.shared.rooms.members_of(room).await?;
        let deliveries = members
            .iter()
            .filter(|member| options.include_self || member.as_str() != self.id())
            .map(|member| self.deliver_to_member(room, member, &envelope, options.volatile));

        let delivered: usize = futures::future::join_all(deliveries).await.iter().sum();
        tracing::debug!(
            room = %room,
            sender = %self.id(),
            delivered,
            "Room fan-out complete"
        );
        Ok(delivered)
    }

    /// Add this session to a room.
    pub async fn join(&self, room: &str) -> EngineResult<()> {
        self.shared.rooms.join(self.id(), room).await?;
        Ok(())
    }

    /// Remove this session from a room.
    pub async fn leave(&self, room: &str) -> EngineResult<()> {
        self.shared.rooms.leave(self.id(), room).await?;
        Ok(())
    }

    /// Rooms this session currently belongs to.
    pub async fn rooms(&self) -> EngineResult<Vec<String>> {
        Ok(self.shared.rooms.rooms_of(self.id()).await?)
    }

    /// One member of a room fan-out. Every failure path returns 0 so the
    /// other members are unaffected.
    async fn deliver_to_member(
        &self,
        room: &str,
        member: &str,
        envelope: &Envelope,
        volatile: bool,
    ) -> usize {
        match self.shared.sessions.get(member).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                // Expired member; drop it from the room instead of queueing
                // into the void.
                if let Err(e) = self.shared.rooms.leave(member, room).await {
                    tracing::warn!(session_id = %member, room = %room, error = %e, "Room prune failed");
                }
                return 0;
            }
            Err(e) => {
                tracing::warn!(session_id = %member, error = %e, "Member lookup failed");
                return 0;
            }
        }

        if !volatile {
            if let Err(e) = self.shared.queue.enqueue(member, envelope).await {
                tracing::warn!(session_id = %member, error = %e, "Fan-out enqueue failed");
                return 0;
            }
        }
        if let Err(e) = self
            .shared
            .queue
            .publish(&Channel::session(member), envelope)
            .await
        {
            tracing::warn!(session_id = %member, error = %e, "Fan-out publish failed");
            // The enqueue already landed; the member catches up on poll.
            return usize::from(!volatile);
        }
        1
    }

    /// Stamp sender and timestamp, compressing the payload past the
    /// configured threshold.
    fn sealed(&self, event: String, data: Value) -> EngineResult<Envelope> {
        let (data, compressed) =
            maybe_compress(&data, self.shared.config.compression_threshold)?;
        let mut envelope = Envelope::new(event, data).with_session(self.id());
        if compressed {
            envelope.compressed = Some(true);
        }
        Ok(envelope)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.session.id)
            .field("namespace", &self.session.namespace)
            .finish_non_exhaustive()
    }
}
