//! Shared routing tables and session data for scenarios.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};
use tether_engine::RoutingTable;

/// Counter for unique test data.
static COUNTER: AtomicU64 = AtomicU64::new(1);

/// Get a unique suffix for test data.
pub fn unique_suffix() -> u64 {
    COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Session data carrying a logical user identity.
#[must_use]
pub fn user_data(user_id: &str) -> HashMap<String, Value> {
    HashMap::from([("userId".to_string(), json!(user_id))])
}

/// Routing for the lobby scenario: `join` puts the session in a room,
/// `chat` fans a text message out to it, `echo` replies directly.
#[must_use]
pub fn lobby_routing() -> RoutingTable {
    RoutingTable::builder()
        .on("join", |ctx| async move {
            let room = ctx.data["room"].as_str().unwrap_or("lobby").to_string();
            ctx.handle.join(&room).await?;
            Ok(None)
        })
        .on("chat", |ctx| async move {
            let room = ctx.data["room"].as_str().unwrap_or("lobby").to_string();
            let text = ctx.data["text"].clone();
            ctx.handle
                .broadcast_to_room(&room, "chat", json!({ "text": text }))
                .await?;
            Ok(None)
        })
        .on("echo", |ctx| async move { Ok(Some(ctx.data)) })
        .build()
}
