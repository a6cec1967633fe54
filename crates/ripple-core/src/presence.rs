//! Presence heartbeat tracking.
//!
//! Presence-channel members are expected to refresh a heartbeat;
//! a periodic sweep evicts entries that have gone silent past the
//! timeout. Evictions are reported to the caller, which broadcasts
//! `member_removed` and updates the registry.

use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A member evicted by the sweeper.
#[derive(Debug, Clone, PartialEq)]
pub struct Eviction {
    pub channel: String,
    pub socket_id: String,
    pub member: Value,
}

#[derive(Debug)]
struct HeartbeatEntry {
    last_seen: Instant,
    member: Value,
}

/// Per-channel heartbeat state for presence members.
#[derive(Default)]
pub struct HeartbeatTracker {
    entries: DashMap<(String, String), HeartbeatEntry>,
}

impl HeartbeatTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a member after it joins a presence channel.
    pub fn track(&self, channel: &str, socket_id: &str, member: Value) {
        self.entries.insert(
            (channel.to_string(), socket_id.to_string()),
            HeartbeatEntry {
                last_seen: Instant::now(),
                member,
            },
        );
    }

    /// Refresh the heartbeat for one channel membership.
    ///
    /// Returns `false` when the membership is not tracked.
    pub fn touch(&self, channel: &str, socket_id: &str) -> bool {
        match self
            .entries
            .get_mut(&(channel.to_string(), socket_id.to_string()))
        {
            Some(mut entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Refresh every membership a socket holds.
    pub fn touch_socket(&self, socket_id: &str) {
        let now = Instant::now();
        for mut entry in self.entries.iter_mut() {
            if entry.key().1 == socket_id {
                entry.last_seen = now;
            }
        }
    }

    /// Stop tracking one membership.
    pub fn forget(&self, channel: &str, socket_id: &str) {
        self.entries
            .remove(&(channel.to_string(), socket_id.to_string()));
    }

    /// Stop tracking every membership a socket holds.
    pub fn forget_socket(&self, socket_id: &str) {
        self.entries.retain(|(_, sid), _| sid != socket_id);
    }

    /// Number of tracked memberships.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict every membership silent for longer than `timeout`.
    pub fn sweep(&self, timeout: Duration) -> Vec<Eviction> {
        let now = Instant::now();
        let stale: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| now.duration_since(e.value().last_seen) > timeout)
            .map(|e| e.key().clone())
            .collect();

        let mut evictions = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(((channel, socket_id), entry)) = self.entries.remove(&key) {
                debug!(channel = %channel, socket = %socket_id, "Evicting silent presence member");
                evictions.push(Eviction {
                    channel,
                    socket_id,
                    member: entry.member,
                });
            }
        }
        evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_silent_members() {
        let tracker = HeartbeatTracker::new();
        tracker.track("presence-chat.1", "s1", json!({"id": "u1"}));
        tracker.track("presence-chat.1", "s2", json!({"id": "u2"}));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(tracker.touch("presence-chat.1", "s2"));

        let evictions = tracker.sweep(Duration::from_secs(30));
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].socket_id, "s1");
        assert_eq!(evictions[0].member, json!({"id": "u1"}));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_members_survive() {
        let tracker = HeartbeatTracker::new();
        tracker.track("presence-chat.1", "s1", json!({}));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(tracker.sweep(Duration::from_secs(30)).is_empty());
    }

    #[tokio::test]
    async fn test_forget_socket_clears_all_memberships() {
        let tracker = HeartbeatTracker::new();
        tracker.track("presence-a", "s1", json!({}));
        tracker.track("presence-b", "s1", json!({}));
        tracker.track("presence-a", "s2", json!({}));

        tracker.forget_socket("s1");
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_touch_unknown_membership() {
        let tracker = HeartbeatTracker::new();
        assert!(!tracker.touch("presence-x", "s1"));
    }
}
