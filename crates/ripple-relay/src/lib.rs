//! # ripple-relay
//!
//! Cross-node relay for the Ripple realtime hub.
//!
//! The relay gives a fleet of nodes a shared pub/sub bus plus shared
//! channel, presence, and connection state. Any backend offering
//! pub/sub and TTL'd sets/hashes qualifies; this crate ships a Redis
//! adapter for production and a process-local memory bus for tests and
//! single-host fleets.
//!
//! The adapter never mutates node-local state: the hub listens on the
//! adapter's inbound stream and replays received broadcasts locally,
//! without re-publishing.

pub mod envelope;
pub mod memory;
pub mod redis_relay;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub use envelope::{EnvelopeKind, RelayEnvelope};
pub use memory::{MemoryBus, MemoryRelay};
pub use redis_relay::{RedisRelay, RelayConfig};

/// TTL on shared channel sets and presence hashes.
pub const CHANNEL_TTL: Duration = Duration::from_secs(3600);

/// TTL on shared connection snapshots.
pub const CONNECTION_TTL: Duration = Duration::from_secs(7200);

/// Default key prefix for all shared state.
pub const DEFAULT_KEY_PREFIX: &str = "broadcasting:";

/// Relay failures. Publish failures are logged by the hub; local
/// fan-out still succeeds.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Backend error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Envelope serialization failed.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The adapter is not connected.
    #[error("Relay unavailable: {0}")]
    Unavailable(String),
}

/// The surface a relay backend must honor.
#[async_trait]
pub trait RelayAdapter: Send + Sync {
    /// Publish an envelope to the fleet.
    async fn publish(&self, envelope: &RelayEnvelope) -> Result<(), RelayError>;

    /// Record a socket in a channel's shared set.
    async fn store_channel(&self, channel: &str, socket_id: &str) -> Result<(), RelayError>;

    /// Remove a socket from a channel's shared set.
    async fn remove_channel(&self, channel: &str, socket_id: &str) -> Result<(), RelayError>;

    /// Record a presence member in a channel's shared hash.
    async fn store_presence_member(
        &self,
        channel: &str,
        socket_id: &str,
        member: &Value,
    ) -> Result<(), RelayError>;

    /// Remove a presence member from a channel's shared hash.
    async fn remove_presence_member(
        &self,
        channel: &str,
        socket_id: &str,
    ) -> Result<(), RelayError>;

    /// Store a connection snapshot.
    async fn store_connection(&self, socket_id: &str, snapshot: &Value)
        -> Result<(), RelayError>;

    /// Remove a connection snapshot.
    async fn remove_connection(&self, socket_id: &str) -> Result<(), RelayError>;

    /// Record a dedup key with a TTL.
    ///
    /// Returns `true` when the key was already present (duplicate).
    async fn check_duplicate(&self, key: &str, ttl: Duration) -> Result<bool, RelayError>;

    /// Append a message to a channel's shared time-ordered window.
    async fn append_history(
        &self,
        channel: &str,
        entry: &Value,
        timestamp_ms: u64,
        max_messages: usize,
        ttl: Duration,
    ) -> Result<(), RelayError>;

    /// Fetch window entries with `timestamp > since_ms`, up to `limit`.
    async fn fetch_history(
        &self,
        channel: &str,
        since_ms: u64,
        limit: usize,
    ) -> Result<Vec<Value>, RelayError>;

    /// Round-trip ping.
    async fn health_check(&self) -> Result<(), RelayError>;
}
