//! Recent-message history per channel.
//!
//! Keeps a bounded, time-ordered window of broadcast messages so late
//! subscribers can catch up. The in-memory store trims on write and on
//! read; a relay-backed deployment keeps the same window shape in a
//! shared time-ordered store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A stored broadcast message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub event: String,
    pub data: Value,
    /// Wall-clock time, epoch milliseconds.
    pub timestamp: u64,
    /// Originating socket, when the message came from a client.
    pub socket_id: Option<String>,
}

/// History configuration.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Maximum retained messages per channel.
    pub max_messages: usize,
    /// Maximum message age.
    pub ttl: Duration,
    /// Event names never stored.
    pub exclude_events: Vec<String>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_messages: 100,
            ttl: Duration::from_secs(3600),
            exclude_events: Vec::new(),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// In-memory per-channel message window.
pub struct MessageHistory {
    windows: Mutex<HashMap<String, VecDeque<StoredMessage>>>,
    config: HistoryConfig,
}

impl MessageHistory {
    /// Create a history store.
    #[must_use]
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Append a message to a channel's window.
    ///
    /// Returns the stored record, or `None` when the event is on the
    /// exclusion list.
    pub fn store(
        &self,
        channel: &str,
        event: &str,
        data: Value,
        socket_id: Option<&str>,
    ) -> Option<StoredMessage> {
        if self.config.exclude_events.iter().any(|e| e == event) {
            return None;
        }

        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            event: event.to_string(),
            data,
            timestamp: now_ms(),
            socket_id: socket_id.map(str::to_string),
        };

        let mut windows = self.windows.lock().expect("history lock poisoned");
        let window = windows.entry(channel.to_string()).or_default();
        window.push_back(message.clone());

        let cutoff = now_ms().saturating_sub(self.config.ttl.as_millis() as u64);
        while let Some(front) = window.front() {
            if window.len() > self.config.max_messages || front.timestamp < cutoff {
                window.pop_front();
            } else {
                break;
            }
        }

        Some(message)
    }

    /// Chronological messages with `timestamp > since`, up to `limit`.
    #[must_use]
    pub fn get_history(
        &self,
        channel: &str,
        since: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<StoredMessage> {
        let cutoff = now_ms().saturating_sub(self.config.ttl.as_millis() as u64);
        let windows = self.windows.lock().expect("history lock poisoned");
        let Some(window) = windows.get(channel) else {
            return Vec::new();
        };

        let since = since.unwrap_or(0);
        let iter = window
            .iter()
            .filter(|m| m.timestamp > since && m.timestamp >= cutoff)
            .cloned();
        match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    /// Drop expired messages and empty windows.
    pub fn prune(&self) {
        let cutoff = now_ms().saturating_sub(self.config.ttl.as_millis() as u64);
        let mut windows = self.windows.lock().expect("history lock poisoned");
        for window in windows.values_mut() {
            while window.front().is_some_and(|m| m.timestamp < cutoff) {
                window.pop_front();
            }
        }
        windows.retain(|_, window| !window.is_empty());
    }

    /// Number of channels with a non-empty window.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.windows.lock().expect("history lock poisoned").len()
    }
}
