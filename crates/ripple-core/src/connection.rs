//! Connection handles and the connection table.
//!
//! A handle is the write side of one socket: frames queued on it are
//! delivered in order by the socket's writer task. The handle also
//! tracks buffered bytes so the hub can shed non-critical fan-out on
//! a congested socket.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::debug;

/// Close code for a graceful server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code for policy violations (capacity, overload).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Close code for an oversized inbound frame.
pub const CLOSE_TOO_LARGE: u16 = 1009;

/// Close code for an internal error in the frame loop.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// An outbound item queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A rendered text frame.
    Frame { text: String },
    /// A transport-level keepalive ping.
    Ping,
    /// Close the socket with a code and reason.
    Close { code: u16, reason: String },
}

/// Outcome of queueing a frame on a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Queued for the writer task.
    Queued,
    /// Dropped: the socket is over its backpressure threshold and the
    /// frame was not critical.
    Shed,
    /// The socket's writer is gone.
    Disconnected,
}

/// The write side and identity of one connection.
pub struct ConnectionHandle {
    socket_id: String,
    user_id: Option<String>,
    connected_at: u64,
    sender: mpsc::UnboundedSender<Outbound>,
    buffered: AtomicUsize,
    backpressure_limit: usize,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task consumes.
    #[must_use]
    pub fn channel(
        socket_id: impl Into<String>,
        user_id: Option<String>,
        backpressure_limit: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            socket_id: socket_id.into(),
            user_id,
            connected_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            sender,
            buffered: AtomicUsize::new(0),
            backpressure_limit,
        });
        (handle, receiver)
    }

    /// The socket id.
    #[must_use]
    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    /// The user identity attached at upgrade, if any.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Wall-clock connect time, epoch milliseconds.
    #[must_use]
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    /// Bytes queued but not yet flushed by the writer task.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Whether the socket is past its backpressure threshold.
    #[must_use]
    pub fn is_congested(&self) -> bool {
        self.buffered_bytes() >= self.backpressure_limit
    }

    /// Queue a rendered frame.
    ///
    /// Critical frames are always queued; non-critical frames are shed
    /// while the socket is congested.
    pub fn send(&self, text: String, critical: bool) -> DeliveryStatus {
        if !critical && self.is_congested() {
            debug!(socket = %self.socket_id, "Shedding frame on congested socket");
            return DeliveryStatus::Shed;
        }

        let len = text.len();
        self.buffered.fetch_add(len, Ordering::Relaxed);
        match self.sender.send(Outbound::Frame { text }) {
            Ok(()) => DeliveryStatus::Queued,
            Err(_) => {
                self.buffered.fetch_sub(len, Ordering::Relaxed);
                DeliveryStatus::Disconnected
            }
        }
    }

    /// Credit back bytes the writer task has flushed.
    pub fn mark_flushed(&self, bytes: usize) {
        let mut current = self.buffered.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.buffered.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Queue a transport keepalive ping.
    pub fn ping(&self) {
        let _ = self.sender.send(Outbound::Ping);
    }

    /// Ask the writer task to close the socket.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.sender.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Serializable connection snapshot for the shared store.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "socket_id": self.socket_id,
            "user_id": self.user_id,
            "connected_at": self.connected_at,
        })
    }
}

/// Socket-id to connection handle map.
#[derive(Default)]
pub struct ConnectionTable {
    connections: DashMap<String, Arc<ConnectionHandle>>,
}

impl ConnectionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle, keyed by its socket id.
    pub fn insert(&self, handle: Arc<ConnectionHandle>) {
        self.connections
            .insert(handle.socket_id().to_string(), handle);
    }

    /// Remove and return a handle.
    pub fn remove(&self, socket_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(socket_id).map(|(_, h)| h)
    }

    /// Look up a handle.
    #[must_use]
    pub fn get(&self, socket_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(socket_id).map(|e| Arc::clone(&e))
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// All socket ids.
    #[must_use]
    pub fn socket_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Ask every writer task to close, then drop all handles.
    pub fn close_all(&self, code: u16, reason: &str) {
        for entry in self.connections.iter() {
            entry.value().close(code, reason);
        }
        self.connections.clear();
    }
}
