//! End-to-end scenarios driving the client runtime against a live engine
//! over the memory backend.

use std::time::Duration;

use integration_tests::{
    assert_no_message, lobby_routing, next_message, unique_suffix, user_data, TestHarness,
};
use serde_json::json;
use tether_client::{
    ClientConfig, ClientError, ClientEvent, ClientState, ReconnectPolicy, TransportError,
    TransportMode,
};
use tether_common::TokenService;
use tether_core::{events, PresenceStatus};
use tether_engine::{ConnectOptions, EngineConfig, EngineError, RoutingTable, TokenAuth};

#[tokio::test]
async fn test_lobby_broadcast_reaches_peer_but_not_sender() {
    let harness = TestHarness::new(lobby_routing());
    let room = format!("lobby-{}", unique_suffix());

    let a = harness.client_with(ClientConfig::default().with_data("userId", json!("alice")));
    let b = harness.client_with(ClientConfig::default().with_data("userId", json!("bob")));
    let mut a_events = a.events();
    let mut b_events = b.events();

    let sa = a.connect().await.unwrap();
    b.connect().await.unwrap();
    harness.transport().wait_for_streams(2).await;

    a.emit("join", json!({ "room": room })).await.unwrap();
    b.emit("join", json!({ "room": room })).await.unwrap();
    a.emit("chat", json!({ "room": room, "text": "hi" }))
        .await
        .unwrap();

    let received = next_message(&mut b_events).await;
    assert_eq!(received.event, "chat");
    assert_eq!(received.data["text"], json!("hi"));
    assert_eq!(received.session_id.as_deref(), Some(sa.as_str()));

    // Exclude-self is the default for room fan-out.
    assert_no_message(&mut a_events).await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replays_backlog_exactly_once() {
    let harness = TestHarness::new(lobby_routing());
    let client = harness.client_with(
        ClientConfig::default()
            .with_reconnect(ReconnectPolicy::default().with_base_delay(Duration::from_millis(50))),
    );
    let mut client_events = client.events();
    let first_session = client.connect().await.unwrap();
    match client_events.recv().await.unwrap() {
        ClientEvent::Connected { resumed: false, .. } => {}
        other => panic!("unexpected event {other:?}"),
    }
    harness.transport().wait_for_streams(1).await;

    // The network drops; the session and its queue survive server-side.
    harness.transport().break_streams();
    let handle = harness.session(&first_session).await.unwrap();
    for n in 1..=3 {
        let _pending = handle
            .emit_with_ack("chat", json!({ "n": n }))
            .await
            .unwrap();
    }

    // The client reconnects on its own and resumes the old session.
    loop {
        match client_events.recv().await.unwrap() {
            ClientEvent::Connected { resumed: true, .. } => break,
            ClientEvent::Reconnecting { .. } | ClientEvent::ConnectError { .. } => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    // Each backlog message arrives once, in enqueue order.
    for n in 1..=3 {
        let envelope = next_message(&mut client_events).await;
        assert_eq!(envelope.event, "chat");
        assert_eq!(envelope.data["n"], json!(n));
        assert!(envelope.message_id.is_some());
    }
    assert_no_message(&mut client_events).await;

    // The drain was destructive and the client holds a fresh session.
    assert_eq!(harness.queue().len(&first_session).await.unwrap(), 0);
    let second_session = client.session_id().unwrap();
    assert_ne!(second_session, first_session);
    assert_eq!(client.state(), ClientState::Connected);
}

#[tokio::test]
async fn test_disconnect_cleanup_survives_throwing_handler() {
    let routing = RoutingTable::builder()
        .on("join", |ctx| async move {
            ctx.handle.join("lobby").await?;
            Ok(None)
        })
        .on_disconnect(|_handle| async move { anyhow::bail!("flaky teardown") })
        .build();
    let harness = TestHarness::new(routing);

    let client = harness.client_with(ClientConfig::default().with_data("userId", json!("carol")));
    let session_id = client.connect().await.unwrap();
    client.emit("join", json!({})).await.unwrap();
    assert_eq!(
        harness.rooms().members_of("lobby").await.unwrap(),
        vec![session_id.clone()]
    );

    let err = client.disconnect().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::RequestFailed(_))
    ));

    // Cleanup ran despite the handler error: session gone, room index
    // empty, presence cleared. The client itself is back to idle.
    assert!(harness.rooms().members_of("lobby").await.unwrap().is_empty());
    assert!(matches!(
        harness.engine.poll(&session_id).await,
        Err(EngineError::SessionNotFound(_))
    ));
    assert_eq!(harness.engine.presence().status_of("carol"), None);
    assert_eq!(client.state(), ClientState::Idle);
}

#[tokio::test]
async fn test_ack_round_trip_resolves_exactly_once() {
    let harness = TestHarness::new(lobby_routing());
    let client = harness.client();
    client.connect().await.unwrap();
    harness.transport().wait_for_streams(1).await;

    let reply = client.emit_with_ack("echo", json!({ "n": 7 })).await.unwrap();
    assert_eq!(reply, json!({ "n": 7 }));

    // The sentinel copy of the ack arrives on the stream afterwards and
    // finds the waiter already settled.
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert_eq!(client.pending_acks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sliding_ttl_expires_only_idle_sessions() {
    let config = EngineConfig::default().with_session_ttl(Duration::from_secs(60));
    let harness = TestHarness::with_config(lobby_routing(), config);
    // Heartbeats would slide the window themselves; push them out of the
    // test's horizon.
    let client = harness
        .client_with(ClientConfig::default().with_heartbeat_interval(Duration::from_secs(3600)));
    client.connect().await.unwrap();
    harness.transport().wait_for_streams(1).await;

    // Activity inside the window keeps sliding the deadline.
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(45)).await;
        client.emit("echo", json!({})).await.unwrap();
    }

    // Silence past the window expires the session.
    tokio::time::advance(Duration::from_secs(61)).await;
    let err = client.emit("echo", json!({})).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::SessionExpired)
    ));
}

#[tokio::test]
async fn test_presence_watch_across_clients() {
    let harness = TestHarness::new(lobby_routing());

    let alice = harness.client_with(ClientConfig::default().with_data("userId", json!("alice")));
    let mut alice_events = alice.events();
    alice.connect().await.unwrap();
    harness.transport().wait_for_streams(1).await;

    // Let the presence pump drain alice's own online change before she
    // starts watching.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    alice
        .emit(events::EVENT_PRESENCE_SUBSCRIBE, json!({}))
        .await
        .unwrap();

    let bob = harness.client_with(ClientConfig::default().with_data("userId", json!("bob")));
    bob.connect().await.unwrap();

    loop {
        match alice_events.recv().await.unwrap() {
            ClientEvent::Presence(change) => {
                assert_eq!(change.user_id, "bob");
                assert_eq!(change.status, PresenceStatus::Online);
                break;
            }
            ClientEvent::Connected { .. } => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_polling_mode_drains_server_pushes() {
    let harness = TestHarness::new(lobby_routing());
    let client = harness
        .client_with(ClientConfig::default().with_poll_interval(Duration::from_millis(100)));
    let mut client_events = client.events();
    let session_id = client.connect().await.unwrap();
    harness.transport().wait_for_streams(1).await;

    client.set_mode(TransportMode::Polling).await.unwrap();
    while client.mode() != TransportMode::Polling {
        tokio::task::yield_now().await;
    }

    let handle = harness.session(&session_id).await.unwrap();
    handle
        .emit("news", json!({ "headline": "tether ships" }))
        .await
        .unwrap();

    let received = next_message(&mut client_events).await;
    assert_eq!(received.event, "news");
    assert_eq!(received.data["headline"], json!("tether ships"));
    assert_eq!(client.session_id().unwrap(), session_id);

    // Delivered once: the queue copy was drained, and no stream survived
    // the mode switch to deliver the published copy.
    assert_no_message(&mut client_events).await;
}

#[tokio::test]
async fn test_token_auth_gates_connect() {
    let tokens = TokenService::new("integration-secret", 3600);
    let routing = RoutingTable::builder()
        .with_middleware(TokenAuth::new(tokens.clone()))
        .build();
    let harness = TestHarness::new(routing);

    let token = tokens.issue("alice").unwrap();
    let authed = harness.client_with(ClientConfig::default().with_auth(token));
    authed.connect().await.unwrap();
    assert_eq!(authed.state(), ClientState::Connected);

    let unauthed = harness.client();
    let err = unauthed.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::ConnectFailed(_))
    ));
    assert_eq!(unauthed.state(), ClientState::Idle);
}

#[tokio::test]
async fn test_broadcast_reaches_streams_but_never_queues() {
    let routing = RoutingTable::builder()
        .on("announce", |ctx| async move {
            ctx.handle.broadcast("announce", ctx.data).await?;
            Ok(None)
        })
        .build();
    let harness = TestHarness::new(routing);

    let a = harness.client();
    let b = harness.client();
    let mut a_events = a.events();
    let mut b_events = b.events();
    let sa = a.connect().await.unwrap();
    b.connect().await.unwrap();
    harness.transport().wait_for_streams(2).await;

    // A third session with no live stream; broadcast must not queue for it.
    let offline = harness
        .engine
        .connect(ConnectOptions {
            data: user_data("dan"),
            ..Default::default()
        })
        .await
        .unwrap();

    a.emit("announce", json!({ "v": 2 })).await.unwrap();

    let received = next_message(&mut b_events).await;
    assert_eq!(received.event, "announce");
    assert_eq!(received.data["v"], json!(2));
    assert_eq!(received.session_id.as_deref(), Some(sa.as_str()));

    // The sender's stream filters its own broadcast copy.
    assert_no_message(&mut a_events).await;
    // Nothing durable was written for the streamless session.
    assert!(harness
        .engine
        .poll(&offline.session_id)
        .await
        .unwrap()
        .is_empty());
}
