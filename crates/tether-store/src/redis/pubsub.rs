//! Redis pub/sub listener.
//!
//! One background task owns the dedicated pub/sub connection and routes
//! incoming messages to per-channel subscriptions. Channels are subscribed
//! at the store level when the first local subscription appears and
//! unsubscribed when the last one is dropped. The task reconnects and
//! restores its channel set after connection loss.

use crate::backend::Subscription;
use crate::error::{StoreError, StoreResult};
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::Client;
use std::sync::Arc;
use tokio::sync::mpsc;

type ChannelRegistry = DashMap<String, Vec<mpsc::UnboundedSender<String>>>;

/// Listener configuration
#[derive(Debug, Clone)]
pub struct PubSubListenerConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Reconnection delay in milliseconds
    pub reconnect_delay_ms: u64,
}

impl Default for PubSubListenerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            reconnect_delay_ms: 1000,
        }
    }
}

/// Commands for subscription management
#[derive(Debug)]
enum ListenerCommand {
    Subscribe(String),
    Release(String),
    Shutdown,
}

/// Redis pub/sub listener with per-channel message routing
pub struct PubSubListener {
    registry: Arc<ChannelRegistry>,
    control_tx: mpsc::UnboundedSender<ListenerCommand>,
}

impl PubSubListener {
    /// Create a new listener and start the background routing task
    pub fn new(config: PubSubListenerConfig) -> StoreResult<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let registry: Arc<ChannelRegistry> = Arc::new(DashMap::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::listener_loop(
            config,
            client,
            registry.clone(),
            control_rx,
        ));

        Ok(Self {
            registry,
            control_tx,
        })
    }

    /// Background listener loop
    async fn listener_loop(
        config: PubSubListenerConfig,
        client: Client,
        registry: Arc<ChannelRegistry>,
        mut control_rx: mpsc::UnboundedReceiver<ListenerCommand>,
    ) {
        loop {
            match Self::run(&client, &registry, &mut control_rx).await {
                Ok(should_stop) => {
                    if should_stop {
                        tracing::info!("Pub/sub listener shutting down");
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Pub/sub listener error, reconnecting...");
                    tokio::time::sleep(tokio::time::Duration::from_millis(
                        config.reconnect_delay_ms,
                    ))
                    .await;
                }
            }
        }
    }

    /// Run the listener until error or shutdown
    async fn run(
        client: &Client,
        registry: &Arc<ChannelRegistry>,
        control_rx: &mut mpsc::UnboundedReceiver<ListenerCommand>,
    ) -> StoreResult<bool> {
        let mut pubsub = client.get_async_pubsub().await?;

        // Restore subscriptions after (re)connect
        let channels: Vec<String> = registry.iter().map(|e| e.key().clone()).collect();
        for channel in &channels {
            pubsub.subscribe(channel).await?;
        }

        tracing::info!(channels = channels.len(), "Pub/sub listener connected");

        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(msg) => {
                            let channel = msg.get_channel_name().to_string();
                            let payload: String = msg.get_payload().unwrap_or_default();
                            Self::route(registry, &channel, &payload);
                        }
                        None => {
                            tracing::warn!("Pub/sub stream ended");
                            return Ok(false);
                        }
                    }
                }

                cmd = control_rx.recv() => {
                    match cmd {
                        Some(ListenerCommand::Subscribe(channel)) => {
                            // Need to drop stream to access pubsub
                            drop(stream);
                            // A release may have raced the command; only
                            // subscribe while a local subscription exists
                            if registry.contains_key(&channel) {
                                if let Err(e) = pubsub.subscribe(&channel).await {
                                    tracing::error!(channel = %channel, error = %e, "Failed to subscribe");
                                } else {
                                    tracing::debug!(channel = %channel, "Subscribed to channel");
                                }
                            }
                            stream = pubsub.on_message();
                        }
                        Some(ListenerCommand::Release(channel)) => {
                            let released = match registry.get_mut(&channel) {
                                Some(mut senders) => {
                                    senders.retain(|tx| !tx.is_closed());
                                    senders.is_empty()
                                }
                                None => false,
                            };
                            if released {
                                registry.remove_if(&channel, |_, v| v.is_empty());
                                drop(stream);
                                if let Err(e) = pubsub.unsubscribe(&channel).await {
                                    tracing::warn!(channel = %channel, error = %e, "Failed to unsubscribe");
                                } else {
                                    tracing::debug!(channel = %channel, "Unsubscribed from channel");
                                }
                                stream = pubsub.on_message();
                            }
                        }
                        Some(ListenerCommand::Shutdown) | None => {
                            return Ok(true);
                        }
                    }
                }
            }
        }
    }

    /// Deliver a payload to every live subscription for a channel
    fn route(registry: &ChannelRegistry, channel: &str, payload: &str) {
        if let Some(mut senders) = registry.get_mut(channel) {
            senders.retain(|tx| tx.send(payload.to_string()).is_ok());
            tracing::trace!(channel = %channel, receivers = senders.len(), "Routed pub/sub message");
        }
    }

    /// Open a subscription for a channel
    pub fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();

        let first = {
            let mut entry = self.registry.entry(channel.to_string()).or_default();
            entry.push(tx);
            entry.len() == 1
        };

        if first {
            self.control_tx
                .send(ListenerCommand::Subscribe(channel.to_string()))
                .map_err(|_| StoreError::ListenerUnavailable)?;
        }

        let control = self.control_tx.clone();
        let name = channel.to_string();
        Ok(Subscription::new(
            channel.to_string(),
            rx,
            Some(Box::new(move || {
                let _ = control.send(ListenerCommand::Release(name));
            })),
        ))
    }

    /// Stop the background task
    pub fn shutdown(&self) {
        let _ = self.control_tx.send(ListenerCommand::Shutdown);
    }
}

impl std::fmt::Debug for PubSubListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubListener")
            .field("channels", &self.registry.len())
            .finish_non_exhaustive()
    }
}
