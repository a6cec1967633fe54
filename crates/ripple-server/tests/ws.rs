//! End-to-end WebSocket tests against a running server.

use futures_util::{SinkExt, StreamExt};
use ripple_server::{spawn_server, Config, Hub, ServerHandle};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(mutate: impl FnOnce(&mut Config)) -> ServerHandle {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.rate_limit.max = 0;
    mutate(&mut config);

    let hub = Hub::new(config, None);
    spawn_server(hub, None).await.expect("server start")
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

/// Connect and consume `connection_established`, returning the
/// assigned socket id.
async fn connect_client(addr: SocketAddr, path: &str) -> (WsClient, String) {
    let (mut ws, _) = connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("connect");
    let established = next_json(&mut ws).await;
    assert_eq!(established["event"], "connection_established");
    let socket_id = established["data"]["socket_id"]
        .as_str()
        .expect("socket_id")
        .to_string();
    (ws, socket_id)
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string())).await.expect("send");
}

async fn subscribe(ws: &mut WsClient, channel: &str) -> Value {
    send_json(ws, json!({"event": "subscribe", "channel": channel})).await;
    let reply = next_json(ws).await;
    assert_eq!(reply["channel"], channel);
    reply
}

#[tokio::test]
async fn public_fanout_with_exclusion() {
    let server = start_server(|_| {}).await;
    let (mut a, socket_a) = connect_client(server.addr, "/app").await;
    let (mut b, _) = connect_client(server.addr, "/ws").await;

    assert_eq!(subscribe(&mut a, "news").await["event"], "subscription_succeeded");
    assert_eq!(subscribe(&mut b, "news").await["event"], "subscription_succeeded");

    server
        .hub
        .broadcast("news", "article.created", json!({"title": "T"}), None)
        .await;

    for ws in [&mut a, &mut b] {
        let frame = next_json(ws).await;
        assert_eq!(frame["event"], "article.created");
        assert_eq!(frame["channel"], "news");
        assert_eq!(frame["data"]["title"], "T");
    }

    server
        .hub
        .broadcast("news", "article.updated", json!({}), Some(&socket_a))
        .await;
    assert_eq!(next_json(&mut b).await["event"], "article.updated");
    expect_silence(&mut a, 200).await;

    server.shutdown().await;
}

#[tokio::test]
async fn private_channel_authorization() {
    let server = start_server(|_| {}).await;
    server
        .hub
        .authorizer()
        .register_fn("private-user.{userId}", |ctx| {
            if ctx.params.get("userId").map(String::as_str) == Some("123") {
                Ok(ripple_core::AuthDecision::Allow)
            } else {
                Ok(ripple_core::AuthDecision::Deny)
            }
        })
        .unwrap();

    let (mut ws, _) = connect_client(server.addr, "/app").await;

    let reply = subscribe(&mut ws, "private-user.123").await;
    assert_eq!(reply["event"], "subscription_succeeded");

    let reply = subscribe(&mut ws, "private-user.999").await;
    assert_eq!(reply["event"], "subscription_error");
    assert_eq!(reply["data"]["type"], "AuthError");
    assert_eq!(reply["data"]["status"], 401);

    // No rule at all is an auth failure too.
    let reply = subscribe(&mut ws, "private-other").await;
    assert_eq!(reply["data"]["status"], 401);

    server.shutdown().await;
}

#[tokio::test]
async fn presence_lifecycle() {
    let server = start_server(|_| {}).await;
    server
        .hub
        .authorizer()
        .register_fn("presence-chat.{roomId}", |ctx| {
            Ok(ripple_core::AuthDecision::AllowPresence(
                json!({"id": ctx.socket_id, "info": {}}),
            ))
        })
        .unwrap();

    let (mut a, socket_a) = connect_client(server.addr, "/app").await;
    let (mut b, socket_b) = connect_client(server.addr, "/app").await;

    let reply = subscribe(&mut a, "presence-chat.1").await;
    assert_eq!(reply["event"], "subscription_succeeded");
    assert_eq!(reply["data"]["presence"]["count"], 1);
    assert_eq!(reply["data"]["presence"]["ids"][0], socket_a.as_str());

    let reply = subscribe(&mut b, "presence-chat.1").await;
    assert_eq!(reply["data"]["presence"]["count"], 2);
    assert!(reply["data"]["presence"]["hash"][&socket_a].is_object());
    assert!(reply["data"]["presence"]["hash"][&socket_b].is_object());

    // A sees B join; B never sees its own member_added.
    let frame = next_json(&mut a).await;
    assert_eq!(frame["event"], "member_added");
    assert_eq!(frame["data"]["id"], socket_b.as_str());

    b.close(None).await.expect("close");
    let frame = next_json(&mut a).await;
    assert_eq!(frame["event"], "member_removed");
    assert_eq!(frame["data"]["id"], socket_b.as_str());

    server.shutdown().await;
}

#[tokio::test]
async fn client_events_whisper_between_subscribers() {
    let server = start_server(|_| {}).await;
    server
        .hub
        .authorizer()
        .register_fn("private-room.{id}", |_| Ok(ripple_core::AuthDecision::Allow))
        .unwrap();

    let (mut a, _) = connect_client(server.addr, "/app").await;
    let (mut b, _) = connect_client(server.addr, "/app").await;
    subscribe(&mut a, "private-room.7").await;
    subscribe(&mut b, "private-room.7").await;

    send_json(
        &mut a,
        json!({
            "event": "client-typing",
            "channel": "private-room.7",
            "data": {"typing": true},
        }),
    )
    .await;

    let frame = next_json(&mut b).await;
    assert_eq!(frame["event"], "client-typing");
    assert_eq!(frame["data"]["typing"], true);
    expect_silence(&mut a, 200).await;

    server.shutdown().await;
}

#[tokio::test]
async fn rate_limit_blocks_and_recovers() {
    let server = start_server(|config| {
        config.rate_limit.max = 3;
        config.rate_limit.window_ms = 1000;
    })
    .await;
    let (mut ws, _) = connect_client(server.addr, "/app").await;

    for _ in 0..3 {
        send_json(&mut ws, json!({"event": "ping"})).await;
        assert_eq!(next_json(&mut ws).await["event"], "pong");
    }

    send_json(&mut ws, json!({"event": "ping"})).await;
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["event"], "error");
    assert_eq!(frame["data"]["type"], "RateLimitExceeded");
    let retry_after = frame["data"]["retryAfter"].as_u64().expect("retryAfter");
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    assert!(retry_after > now.saturating_sub(100));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    send_json(&mut ws, json!({"event": "ping"})).await;
    assert_eq!(next_json(&mut ws).await["event"], "pong");

    server.shutdown().await;
}

#[tokio::test]
async fn oversized_payload_yields_single_error() {
    let server = start_server(|config| {
        config.security.max_payload_size = 256;
    })
    .await;
    let (mut ws, _) = connect_client(server.addr, "/app").await;
    subscribe(&mut ws, "news").await;

    let frame = json!({
        "event": "client-big",
        "channel": "news",
        "data": "x".repeat(300),
    });
    send_json(&mut ws, frame).await;

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["event"], "error");
    assert_eq!(reply["data"]["type"], "PayloadTooLarge");
    expect_silence(&mut ws, 200).await;

    server.shutdown().await;
}

#[tokio::test]
async fn batch_subscribe_over_the_wire() {
    let server = start_server(|_| {}).await;
    let (mut ws, _) = connect_client(server.addr, "/app").await;

    send_json(
        &mut ws,
        json!({
            "event": "batch_subscribe",
            "channels": ["alpha", "beta", "private-locked"],
            "messageId": "batch-1",
        }),
    )
    .await;

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["event"], "batch_subscribe_result");
    assert_eq!(reply["messageId"], "batch-1");
    assert_eq!(reply["data"]["succeeded"].as_array().unwrap().len(), 2);
    assert!(reply["data"]["failed"]["private-locked"].is_string());

    send_json(
        &mut ws,
        json!({
            "event": "batch_unsubscribe",
            "channels": ["alpha", "beta"],
            "messageId": "batch-2",
        }),
    )
    .await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["event"], "batch_unsubscribe_result");
    assert_eq!(reply["data"]["succeeded"].as_array().unwrap().len(), 2);

    server.shutdown().await;
}

#[tokio::test]
async fn ack_round_trip_over_the_wire() {
    let server = start_server(|config| {
        config.acknowledgments.timeout_ms = 5000;
    })
    .await;
    let (mut ws, socket_id) = connect_client(server.addr, "/app").await;
    subscribe(&mut ws, "news").await;

    let handle = server
        .hub
        .send_with_ack(&socket_id, "news", "urgent.notice", json!({"n": 1}));

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["event"], "urgent.notice");
    let message_id = frame["messageId"].as_str().unwrap();

    send_json(&mut ws, json!({"event": "ack", "messageId": message_id})).await;
    assert_eq!(handle.wait().await, Ok(()));
    assert_eq!(server.hub.pending_acks(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn auth_gate_on_upgrade() {
    let server = start_server(|config| {
        config.auth.enabled = true;
        config.auth.secret = Some("test-secret".to_string());
    })
    .await;

    // No token: the upgrade is refused.
    let err = connect_async(format!("ws://{}/app", server.addr)).await;
    assert!(err.is_err());

    // A signed token passes.
    let token = ripple_server::auth::sign_token("user-7", "test-secret");
    let request = tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(
        format!("ws://{}/app", server.addr),
    )
    .map(|mut request| {
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {token}").parse().unwrap(),
        );
        request
    })
    .unwrap();

    let (mut ws, _) = connect_async(request).await.expect("authorized connect");
    let established = next_json(&mut ws).await;
    assert_eq!(established["event"], "connection_established");

    server.shutdown().await;
}

#[tokio::test]
async fn http_surface() {
    let server = start_server(|_| {}).await;
    let base = format!("http://{}", server.addr);

    let health: Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert!(health["redis"].is_null());

    let (mut ws, _) = connect_client(server.addr, "/app").await;
    subscribe(&mut ws, "news").await;

    let stats: Value = reqwest::get(format!("{base}/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["connections"], 1);
    assert_eq!(stats["channels"], 1);
    assert!(stats["uptime"].is_u64());
    assert!(stats["node_id"].is_string());

    server.shutdown().await;
}

#[tokio::test]
async fn graceful_shutdown_closes_with_going_away() {
    let server = start_server(|_| {}).await;
    let (mut ws, _) = connect_client(server.addr, "/app").await;
    subscribe(&mut ws, "news").await;

    server.hub.stop().await;

    let mut saw_close = false;
    while let Ok(Some(Ok(msg))) =
        tokio::time::timeout(Duration::from_secs(2), ws.next()).await
    {
        if let Message::Close(frame) = msg {
            let frame = frame.expect("close frame");
            assert_eq!(u16::from(frame.code), 1001);
            saw_close = true;
            break;
        }
    }
    assert!(saw_close, "expected a 1001 close frame");
}
