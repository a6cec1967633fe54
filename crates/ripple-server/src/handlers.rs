//! HTTP and WebSocket handlers.
//!
//! Upgrades land on `/app` and `/ws`; every connection gets a fresh
//! socket-id, a writer task draining its outbound queue, and a reader
//! loop feeding the dispatcher. `/health`, `/stats`, and `/metrics`
//! make up the rest of the surface.

use crate::auth;
use crate::config::Config;
use crate::dispatch::dispatch_text;
use crate::hub::Hub;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{FutureExt, SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use ripple_core::connection::{CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION};
use ripple_core::{ConnectionHandle, Outbound};
use ripple_protocol::{codec, ErrorKind, ServerFrame};
use ripple_relay::{RedisRelay, RelayAdapter};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared handler state.
pub struct AppState {
    pub hub: Arc<Hub>,
    pub metrics_handle: Option<PrometheusHandle>,
}

/// A running server, for embedding and tests.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub hub: Arc<Hub>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop the hub and tear the listener down.
    pub async fn shutdown(self) {
        self.hub.stop().await;
        self.task.abort();
    }
}

/// Build the axum router for a hub.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = &state.hub.config().security.cors;
    let mut router = Router::new()
        .route("/app", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone());

    if cors.enabled {
        let layer = if cors.origins.is_empty() {
            CorsLayer::permissive()
        } else {
            let origins: Vec<HeaderValue> = cors
                .origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new().allow_origin(origins)
        };
        router = router.layer(layer);
    }

    router.layer(TraceLayer::new_for_http())
}

/// Bind the listener, start the hub, and serve in the background.
///
/// # Errors
///
/// Returns an error if binding fails.
pub async fn spawn_server(
    hub: Arc<Hub>,
    metrics_handle: Option<PrometheusHandle>,
) -> Result<ServerHandle> {
    let addr = hub.config().bind_addr()?;
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;

    hub.start();
    let state = Arc::new(AppState {
        hub: Arc::clone(&hub),
        metrics_handle,
    });
    let app = build_router(state);

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Server error");
        }
    });

    info!("Ripple listening on {addr}");
    info!("WebSocket endpoints: ws://{addr}/app and ws://{addr}/ws");
    Ok(ServerHandle { addr, hub, task })
}

/// Run the server until interrupted.
///
/// # Errors
///
/// Returns an error if startup fails.
pub async fn run_server(config: Config) -> Result<()> {
    let relay = if config.relay.enabled {
        let (adapter, rx) = RedisRelay::connect(config.relay.to_relay()).await?;
        Some((Arc::new(adapter) as Arc<dyn RelayAdapter>, rx))
    } else {
        None
    };

    let metrics_handle = if config.metrics.enabled {
        metrics::install()
    } else {
        None
    };

    let hub = Hub::new(config, relay);
    let server = spawn_server(hub, metrics_handle).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    server.shutdown().await;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let redis = state.hub.relay_healthy().await;
    axum::Json(serde_json::json!({
        "status": "ok",
        "redis": redis,
    }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(state.hub.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let user_id = match auth::authenticate(&headers, &state.hub.config().auth) {
        Ok(user_id) => user_id,
        Err(()) => {
            metrics::record_error("auth");
            return (StatusCode::UNAUTHORIZED, "invalid or missing token").into_response();
        }
    };

    // The transport bound sits above the application bound so frames
    // between the two get a PayloadTooLarge error instead of a drop.
    let transport_limit = state.hub.config().security.max_payload_size.saturating_mul(2);
    let hub = Arc::clone(&state.hub);
    ws.max_message_size(transport_limit)
        .on_upgrade(move |socket| handle_socket(socket, hub, user_id))
}

/// Drive one WebSocket connection to completion.
async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, user_id: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    if hub.admit_connection().is_err() {
        metrics::record_error("capacity");
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_POLICY_VIOLATION,
                reason: "server at capacity".into(),
            })))
            .await;
        return;
    }

    let _metrics_guard = ConnectionMetricsGuard::new();
    let socket_id = Uuid::new_v4().to_string();
    let (handle, mut outbound_rx) =
        ConnectionHandle::channel(&socket_id, user_id.clone(), hub.backpressure_threshold());
    hub.register_connection(Arc::clone(&handle)).await;
    debug!(socket = %socket_id, "WebSocket connected");

    // First frame on every connection, ahead of anything else.
    handle.send(
        codec::encode(&ServerFrame::ConnectionEstablished {
            socket_id: socket_id.clone(),
            activity_timeout: hub.config().server.idle_timeout_secs,
        }),
        true,
    );

    let writer_handle = Arc::clone(&handle);
    let writer = tokio::spawn(async move {
        while let Some(item) = outbound_rx.recv().await {
            match item {
                Outbound::Frame { text } => {
                    let len = text.len();
                    let sent = ws_tx.send(Message::Text(text)).await;
                    writer_handle.mark_flushed(len);
                    if sent.is_err() {
                        break;
                    }
                }
                Outbound::Ping => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let idle = Duration::from_secs(hub.config().server.idle_timeout_secs.max(1));
    let send_pings = hub.config().server.send_pings;
    let mut ping_interval = tokio::time::interval(Duration::from_secs(
        hub.config().server.ping_interval_secs.max(1),
    ));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_activity = tokio::time::Instant::now();

    loop {
        let idle_deadline = last_activity + idle;
        tokio::select! {
            () = tokio::time::sleep_until(idle_deadline) => {
                debug!(socket = %socket_id, "Idle timeout");
                handle.close(CLOSE_GOING_AWAY, "idle timeout");
                break;
            }

            _ = ping_interval.tick(), if send_pings => {
                handle.ping();
            }

            msg = ws_rx.next() => {
                last_activity = tokio::time::Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let dispatched = AssertUnwindSafe(dispatch_text(
                            &hub,
                            &socket_id,
                            user_id.as_deref(),
                            &text,
                        ))
                        .catch_unwind()
                        .await;
                        if dispatched.is_err() {
                            // A bug in the frame loop takes this socket
                            // down, never the server.
                            error!(socket = %socket_id, "Panic while handling frame");
                            metrics::record_error("panic");
                            handle.close(CLOSE_INTERNAL_ERROR, "internal error");
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        hub.send_to_socket(
                            &socket_id,
                            &ServerFrame::error(
                                ErrorKind::NotSupported,
                                "binary frames are not supported",
                            ),
                        );
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // The transport answers pings; both refresh
                        // last_activity above.
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(socket = %socket_id, "Client closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(socket = %socket_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    hub.disconnect(&socket_id).await;
    writer.abort();
    debug!(socket = %socket_id, "WebSocket disconnected");
}
