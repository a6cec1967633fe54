//! In-process relay backend.
//!
//! A [`MemoryBus`] stands in for the shared broker: every adapter
//! created from the same bus sees every published envelope, exactly
//! like peers sharing a Redis instance. Used by tests and single-host
//! multi-node setups.

use crate::envelope::RelayEnvelope;
use crate::{RelayAdapter, RelayError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

#[derive(Default)]
struct SharedState {
    channels: HashMap<String, HashSet<String>>,
    presence: HashMap<String, HashMap<String, Value>>,
    connections: HashMap<String, Value>,
    dedup: HashMap<String, (Instant, Duration)>,
    history: HashMap<String, Vec<(u64, Value)>>,
}

/// The shared side of the in-process relay.
pub struct MemoryBus {
    sender: broadcast::Sender<RelayEnvelope>,
    state: Mutex<SharedState>,
}

impl MemoryBus {
    /// Create a bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(1024);
        Arc::new(Self {
            sender,
            state: Mutex::new(SharedState::default()),
        })
    }

    /// Create an adapter attached to this bus, together with its
    /// inbound envelope stream.
    #[must_use]
    pub fn adapter(self: &Arc<Self>) -> (MemoryRelay, mpsc::UnboundedReceiver<RelayEnvelope>) {
        let mut bus_rx = self.sender.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(envelope) => {
                        if tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        (
            MemoryRelay {
                bus: Arc::clone(self),
            },
            rx,
        )
    }

    /// Sockets recorded for a channel across the fleet.
    #[must_use]
    pub fn channel_sockets(&self, channel: &str) -> Vec<String> {
        let state = self.state.lock().expect("bus lock poisoned");
        state
            .channels
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Presence members recorded for a channel across the fleet.
    #[must_use]
    pub fn presence_members(&self, channel: &str) -> HashMap<String, Value> {
        let state = self.state.lock().expect("bus lock poisoned");
        state.presence.get(channel).cloned().unwrap_or_default()
    }

    /// A stored connection snapshot.
    #[must_use]
    pub fn connection(&self, socket_id: &str) -> Option<Value> {
        let state = self.state.lock().expect("bus lock poisoned");
        state.connections.get(socket_id).cloned()
    }
}

/// One node's handle to the in-process relay.
pub struct MemoryRelay {
    bus: Arc<MemoryBus>,
}

#[async_trait]
impl RelayAdapter for MemoryRelay {
    async fn publish(&self, envelope: &RelayEnvelope) -> Result<(), RelayError> {
        // No receivers is fine: a single-node fleet.
        let _ = self.bus.sender.send(envelope.clone());
        Ok(())
    }

    async fn store_channel(&self, channel: &str, socket_id: &str) -> Result<(), RelayError> {
        let mut state = self.bus.state.lock().expect("bus lock poisoned");
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(socket_id.to_string());
        Ok(())
    }

    async fn remove_channel(&self, channel: &str, socket_id: &str) -> Result<(), RelayError> {
        let mut state = self.bus.state.lock().expect("bus lock poisoned");
        if let Some(set) = state.channels.get_mut(channel) {
            set.remove(socket_id);
            if set.is_empty() {
                state.channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn store_presence_member(
        &self,
        channel: &str,
        socket_id: &str,
        member: &Value,
    ) -> Result<(), RelayError> {
        let mut state = self.bus.state.lock().expect("bus lock poisoned");
        state
            .presence
            .entry(channel.to_string())
            .or_default()
            .insert(socket_id.to_string(), member.clone());
        Ok(())
    }

    async fn remove_presence_member(
        &self,
        channel: &str,
        socket_id: &str,
    ) -> Result<(), RelayError> {
        let mut state = self.bus.state.lock().expect("bus lock poisoned");
        if let Some(members) = state.presence.get_mut(channel) {
            members.remove(socket_id);
            if members.is_empty() {
                state.presence.remove(channel);
            }
        }
        Ok(())
    }

    async fn store_connection(
        &self,
        socket_id: &str,
        snapshot: &Value,
    ) -> Result<(), RelayError> {
        let mut state = self.bus.state.lock().expect("bus lock poisoned");
        state
            .connections
            .insert(socket_id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn remove_connection(&self, socket_id: &str) -> Result<(), RelayError> {
        let mut state = self.bus.state.lock().expect("bus lock poisoned");
        state.connections.remove(socket_id);
        Ok(())
    }

    async fn check_duplicate(&self, key: &str, ttl: Duration) -> Result<bool, RelayError> {
        let now = Instant::now();
        let mut state = self.bus.state.lock().expect("bus lock poisoned");
        if let Some((inserted, entry_ttl)) = state.dedup.get(key) {
            if now.duration_since(*inserted) <= *entry_ttl {
                return Ok(true);
            }
        }
        state.dedup.insert(key.to_string(), (now, ttl));
        Ok(false)
    }

    async fn append_history(
        &self,
        channel: &str,
        entry: &Value,
        timestamp_ms: u64,
        max_messages: usize,
        ttl: Duration,
    ) -> Result<(), RelayError> {
        let cutoff = timestamp_ms.saturating_sub(ttl.as_millis() as u64);
        let mut state = self.bus.state.lock().expect("bus lock poisoned");
        let window = state.history.entry(channel.to_string()).or_default();
        window.push((timestamp_ms, entry.clone()));
        window.retain(|(ts, _)| *ts >= cutoff);
        if window.len() > max_messages {
            let excess = window.len() - max_messages;
            window.drain(..excess);
        }
        Ok(())
    }

    async fn fetch_history(
        &self,
        channel: &str,
        since_ms: u64,
        limit: usize,
    ) -> Result<Vec<Value>, RelayError> {
        let state = self.bus.state.lock().expect("bus lock poisoned");
        Ok(state
            .history
            .get(channel)
            .map(|window| {
                window
                    .iter()
                    .filter(|(ts, _)| *ts > since_ms)
                    .take(limit)
                    .map(|(_, entry)| entry.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn health_check(&self) -> Result<(), RelayError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_every_adapter() {
        let bus = MemoryBus::new();
        let (node1, mut rx1) = bus.adapter();
        let (_node2, mut rx2) = bus.adapter();

        let envelope = RelayEnvelope::broadcast("news", "e", json!({}), None, "node-1");
        node1.publish(&envelope).await.unwrap();

        // The publisher's own stream receives it too, like a real
        // pattern subscription; loopback is dropped downstream.
        assert_eq!(rx1.recv().await.unwrap(), envelope);
        assert_eq!(rx2.recv().await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_shared_channel_and_presence_state() {
        let bus = MemoryBus::new();
        let (node1, _rx1) = bus.adapter();
        let (node2, _rx2) = bus.adapter();

        node1.store_channel("news", "s1").await.unwrap();
        node2.store_channel("news", "s2").await.unwrap();
        let mut sockets = bus.channel_sockets("news");
        sockets.sort();
        assert_eq!(sockets, vec!["s1", "s2"]);

        node1
            .store_presence_member("presence-x", "s1", &json!({"id": "u1"}))
            .await
            .unwrap();
        assert_eq!(bus.presence_members("presence-x").len(), 1);

        node1.remove_presence_member("presence-x", "s1").await.unwrap();
        assert!(bus.presence_members("presence-x").is_empty());

        node1.remove_channel("news", "s1").await.unwrap();
        node2.remove_channel("news", "s2").await.unwrap();
        assert!(bus.channel_sockets("news").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_keys_respect_ttl() {
        let bus = MemoryBus::new();
        let (node, _rx) = bus.adapter();

        let ttl = Duration::from_millis(100);
        assert!(!node.check_duplicate("k", ttl).await.unwrap());
        assert!(node.check_duplicate("k", ttl).await.unwrap());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!node.check_duplicate("k", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_history_window() {
        let bus = MemoryBus::new();
        let (node, _rx) = bus.adapter();
        let ttl = Duration::from_secs(60);

        for i in 0u64..5 {
            node.append_history("news", &json!({"n": i}), 1000 + i, 3, ttl)
                .await
                .unwrap();
        }

        let all = node.fetch_history("news", 0, 100).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0]["n"], 2);

        let after = node.fetch_history("news", 1003, 100).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0]["n"], 4);
    }
}
