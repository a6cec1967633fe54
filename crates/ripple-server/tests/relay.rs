//! Multi-node tests over the in-process relay bus.

use futures_util::{SinkExt, StreamExt};
use ripple_relay::{MemoryBus, RelayAdapter};
use ripple_server::{spawn_server, Config, Hub, ServerHandle};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_node(bus: &Arc<MemoryBus>, mutate: impl FnOnce(&mut Config)) -> ServerHandle {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.rate_limit.max = 0;
    mutate(&mut config);

    let (adapter, rx) = bus.adapter();
    let hub = Hub::new(config, Some((Arc::new(adapter) as Arc<dyn RelayAdapter>, rx)));
    spawn_server(hub, None).await.expect("node start")
}

async fn next_json(ws: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("invalid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

async fn expect_silence(ws: &mut WsClient, for_ms: u64) {
    let result = tokio::time::timeout(Duration::from_millis(for_ms), ws.next()).await;
    match result {
        Err(_) => {}
        Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
        Ok(other) => panic!("expected silence, got {other:?}"),
    }
}

async fn connect_client(addr: SocketAddr) -> (WsClient, String) {
    let (mut ws, _) = connect_async(format!("ws://{addr}/app"))
        .await
        .expect("connect");
    let established = next_json(&mut ws).await;
    assert_eq!(established["event"], "connection_established");
    let socket_id = established["data"]["socket_id"]
        .as_str()
        .unwrap()
        .to_string();
    (ws, socket_id)
}

async fn subscribe(ws: &mut WsClient, channel: &str) -> Value {
    ws.send(Message::Text(
        json!({"event": "subscribe", "channel": channel}).to_string(),
    ))
    .await
    .expect("send");
    next_json(ws).await
}

#[tokio::test]
async fn cross_node_broadcast_without_echo() {
    let bus = MemoryBus::new();
    let node1 = start_node(&bus, |_| {}).await;
    let node2 = start_node(&bus, |_| {}).await;

    let (mut c1, _) = connect_client(node1.addr).await;
    let (mut c2, _) = connect_client(node2.addr).await;
    subscribe(&mut c1, "x").await;
    subscribe(&mut c2, "x").await;

    node1.hub.broadcast("x", "e", json!({"n": 1}), None).await;

    // Exactly one copy on each node: the local fan-out for c1, the
    // relayed fan-out for c2, and no loopback duplicate for c1.
    let frame = next_json(&mut c1).await;
    assert_eq!(frame["event"], "e");
    let frame = next_json(&mut c2).await;
    assert_eq!(frame["event"], "e");
    expect_silence(&mut c1, 300).await;
    expect_silence(&mut c2, 300).await;

    node1.shutdown().await;
    node2.shutdown().await;
}

#[tokio::test]
async fn client_events_cross_the_relay() {
    let bus = MemoryBus::new();
    let node1 = start_node(&bus, |_| {}).await;
    let node2 = start_node(&bus, |_| {}).await;
    for node in [&node1, &node2] {
        node.hub
            .authorizer()
            .register_fn("private-room.{id}", |_| {
                Ok(ripple_core::AuthDecision::Allow)
            })
            .unwrap();
    }

    let (mut c1, _) = connect_client(node1.addr).await;
    let (mut c2, _) = connect_client(node2.addr).await;
    subscribe(&mut c1, "private-room.1").await;
    subscribe(&mut c2, "private-room.1").await;

    c1.send(Message::Text(
        json!({
            "event": "client-wave",
            "channel": "private-room.1",
            "data": {"hi": true},
        })
        .to_string(),
    ))
    .await
    .unwrap();

    let frame = next_json(&mut c2).await;
    assert_eq!(frame["event"], "client-wave");
    assert_eq!(frame["data"]["hi"], true);
    // The sender hears nothing back, on either node.
    expect_silence(&mut c1, 300).await;

    node1.shutdown().await;
    node2.shutdown().await;
}

#[tokio::test]
async fn presence_membership_crosses_the_relay() {
    let bus = MemoryBus::new();
    let node1 = start_node(&bus, |_| {}).await;
    let node2 = start_node(&bus, |_| {}).await;
    for node in [&node1, &node2] {
        node.hub
            .authorizer()
            .register_fn("presence-chat.{id}", |ctx| {
                Ok(ripple_core::AuthDecision::AllowPresence(
                    json!({"id": ctx.socket_id}),
                ))
            })
            .unwrap();
    }

    let (mut c1, _) = connect_client(node1.addr).await;
    subscribe(&mut c1, "presence-chat.1").await;

    let (mut c2, socket2) = connect_client(node2.addr).await;
    subscribe(&mut c2, "presence-chat.1").await;

    // The join on node2 reaches the subscriber on node1.
    let frame = next_json(&mut c1).await;
    assert_eq!(frame["event"], "member_added");
    assert_eq!(frame["data"]["id"], socket2.as_str());

    c2.close(None).await.unwrap();
    let frame = next_json(&mut c1).await;
    assert_eq!(frame["event"], "member_removed");
    assert_eq!(frame["data"]["id"], socket2.as_str());

    node1.shutdown().await;
    node2.shutdown().await;
}

#[tokio::test]
async fn shared_state_tracks_fleet_membership() {
    let bus = MemoryBus::new();
    let node1 = start_node(&bus, |_| {}).await;
    let node2 = start_node(&bus, |_| {}).await;

    let (mut c1, socket1) = connect_client(node1.addr).await;
    let (mut c2, socket2) = connect_client(node2.addr).await;
    subscribe(&mut c1, "news").await;
    subscribe(&mut c2, "news").await;

    let mut sockets = bus.channel_sockets("news");
    sockets.sort();
    let mut expected = vec![socket1.clone(), socket2.clone()];
    expected.sort();
    assert_eq!(sockets, expected);
    assert!(bus.connection(&socket1).is_some());

    c1.close(None).await.unwrap();
    // Allow the disconnect path to run.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bus.channel_sockets("news"), vec![socket2.clone()]);
    assert!(bus.connection(&socket1).is_none());

    node1.shutdown().await;
    node2.shutdown().await;
}

#[tokio::test]
async fn relay_backed_history_serves_late_readers() {
    let bus = MemoryBus::new();
    let node1 = start_node(&bus, |config| {
        config.persistence.enabled = true;
        config.persistence.max_messages = 10;
    })
    .await;
    let node2 = start_node(&bus, |config| {
        config.persistence.enabled = true;
        config.persistence.max_messages = 10;
    })
    .await;

    let (mut c1, _) = connect_client(node1.addr).await;
    subscribe(&mut c1, "news").await;

    node1.hub.broadcast("news", "a", json!({"n": 1}), None).await;
    node1.hub.broadcast("news", "b", json!({"n": 2}), None).await;

    // History went through the shared store, so either node serves it.
    let entries = node2.hub.history("news", None, None).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["event"], "a");
    assert_eq!(entries[1]["event"], "b");

    node1.shutdown().await;
    node2.shutdown().await;
}
