//! Event routing
//!
//! Maps inbound event names to application handlers. Registration happens
//! once through [`RoutingTableBuilder`] before the engine starts; the built
//! table is immutable, so dispatch reads it without locks.
//!
//! Resolution order: exact match in the session's namespace first, then the
//! global table. Reserved session-layer events never reach this table.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tether_core::events;

use crate::handle::SessionHandle;
use crate::middleware::Middleware;

/// Everything a handler gets for one dispatched event.
pub struct HandlerContext {
    /// Handle for the session the event arrived on.
    pub handle: SessionHandle,
    /// Event name as received.
    pub event: String,
    /// Decompressed payload.
    pub data: Value,
}

/// Application event handler. Returning `Some(value)` supplies the ack
/// payload when the sender asked for one.
pub type EventHandler =
    Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, anyhow::Result<Option<Value>>> + Send + Sync>;

/// Connect/disconnect hook.
pub type LifecycleHandler =
    Arc<dyn Fn(SessionHandle) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Immutable handler registry.
pub struct RoutingTable {
    global: HashMap<String, EventHandler>,
    namespaced: HashMap<String, HashMap<String, EventHandler>>,
    connect: LifecycleHooks,
    disconnect: LifecycleHooks,
    middleware: Vec<Arc<dyn Middleware>>,
}

/// One lifecycle hook slot: a default plus per-namespace overrides.
#[derive(Default)]
struct LifecycleHooks {
    global: Option<LifecycleHandler>,
    namespaced: HashMap<String, LifecycleHandler>,
}

impl LifecycleHooks {
    fn resolve(&self, namespace: &str) -> Option<LifecycleHandler> {
        self.namespaced
            .get(namespace)
            .or(self.global.as_ref())
            .cloned()
    }
}

impl RoutingTable {
    #[must_use]
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::default()
    }

    /// Find the handler for an event, namespace match first.
    #[must_use]
    pub fn resolve(&self, namespace: &str, event: &str) -> Option<EventHandler> {
        self.namespaced
            .get(namespace)
            .and_then(|table| table.get(event))
            .or_else(|| self.global.get(event))
            .cloned()
    }

    /// Connect hook for a namespace, falling back to the default hook.
    #[must_use]
    pub fn connect_handler(&self, namespace: &str) -> Option<LifecycleHandler> {
        self.connect.resolve(namespace)
    }

    /// Disconnect hook for a namespace, falling back to the default hook.
    #[must_use]
    pub fn disconnect_handler(&self, namespace: &str) -> Option<LifecycleHandler> {
        self.disconnect.resolve(namespace)
    }

    #[must_use]
    pub fn middleware(&self) -> &[Arc<dyn Middleware>] {
        &self.middleware
    }

    /// Total number of registered event handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.global.len() + self.namespaced.values().map(HashMap::len).sum::<usize>()
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("global", &self.global.len())
            .field("namespaces", &self.namespaced.len())
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

/// Builder for [`RoutingTable`].
#[derive(Default)]
pub struct RoutingTableBuilder {
    global: HashMap<String, EventHandler>,
    namespaced: HashMap<String, HashMap<String, EventHandler>>,
    connect: LifecycleHooks,
    disconnect: LifecycleHooks,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl RoutingTableBuilder {
    /// Register a handler for `event` in every namespace.
    #[must_use]
    pub fn on<F, Fut>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        let event = event.into();
        if events::is_reserved(&event) {
            tracing::warn!(event = %event, "Refusing handler for reserved event");
            return self;
        }
        self.global.insert(event, box_handler(handler));
        self
    }

    /// Register a handler for `event` in one namespace only.
    ///
    /// Namespace handlers shadow global ones for the same event name.
    #[must_use]
    pub fn on_namespace<F, Fut>(
        mut self,
        namespace: impl Into<String>,
        event: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        let event = event.into();
        if events::is_reserved(&event) {
            tracing::warn!(event = %event, "Refusing handler for reserved event");
            return self;
        }
        self.namespaced
            .entry(namespace.into())
            .or_default()
            .insert(event, box_handler(handler));
        self
    }

    /// Hook run after a session is created and its client is ready.
    #[must_use]
    pub fn on_connect<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(SessionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.connect.global = Some(box_lifecycle(handler));
        self
    }

    /// Connect hook for sessions in one namespace, overriding the default.
    #[must_use]
    pub fn on_connect_namespace<F, Fut>(mut self, namespace: impl Into<String>, handler: F) -> Self
    where
        F: Fn(SessionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.connect
            .namespaced
            .insert(namespace.into(), box_lifecycle(handler));
        self
    }

    /// Hook run when a session disconnects, before its state is torn down.
    #[must_use]
    pub fn on_disconnect<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(SessionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.disconnect.global = Some(box_lifecycle(handler));
        self
    }

    /// Disconnect hook for sessions in one namespace, overriding the default.
    #[must_use]
    pub fn on_disconnect_namespace<F, Fut>(
        mut self,
        namespace: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(SessionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.disconnect
            .namespaced
            .insert(namespace.into(), box_lifecycle(handler));
        self
    }

    /// Append middleware; runs in registration order.
    #[must_use]
    pub fn with_middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    #[must_use]
    pub fn build(self) -> RoutingTable {
        RoutingTable {
            global: self.global,
            namespaced: self.namespaced,
            connect: self.connect,
            disconnect: self.disconnect,
            middleware: self.middleware,
        }
    }
}

impl std::fmt::Debug for RoutingTableBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTableBuilder")
            .field("global", &self.global.len())
            .field("namespaces", &self.namespaced.len())
            .finish_non_exhaustive()
    }
}

fn box_handler<F, Fut>(handler: F) -> EventHandler
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    Arc::new(move |ctx| -> BoxFuture<'static, anyhow::Result<Option<Value>>> {
        Box::pin(handler(ctx))
    })
}

fn box_lifecycle<F, Fut>(handler: F) -> LifecycleHandler
where
    F: Fn(SessionHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |handle| -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(handler(handle))
    })
}
