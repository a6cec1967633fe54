//! Broadcast deduplication with time-bounded memory.
//!
//! A message is identified by an explicit id or by a content hash of
//! `channel ‖ event ‖ canonical-JSON(data)`. Seen keys expire after a
//! TTL; the set is size-bounded, evicting oldest insertions first.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Deduplication configuration.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Whether deduplication is active.
    pub enabled: bool,
    /// How long a seen key suppresses duplicates.
    pub ttl: Duration,
    /// Maximum retained keys.
    pub max_size: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_size: 10_000,
        }
    }
}

/// Compute the dedup key for a broadcast.
///
/// `serde_json` renders object keys in sorted order, so equal payloads
/// hash equally regardless of the order fields arrived in.
#[must_use]
pub fn dedup_key(channel: &str, event: &str, data: &Value, explicit: Option<&str>) -> String {
    if let Some(id) = explicit {
        return id.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(channel.as_bytes());
    hasher.update([0]);
    hasher.update(event.as_bytes());
    hasher.update([0]);
    hasher.update(data.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Default)]
struct Inner {
    seen: HashMap<String, Instant>,
    /// Insertion order for size-bounded eviction. May carry stale
    /// entries after a key is refreshed; they are skipped by comparing
    /// the recorded instant.
    order: VecDeque<(String, Instant)>,
}

/// In-memory seen-set deduplicator.
pub struct Deduplicator {
    inner: Mutex<Inner>,
    config: DedupConfig,
}

impl Deduplicator {
    /// Create a deduplicator.
    #[must_use]
    pub fn new(config: DedupConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
        }
    }

    /// Check-and-record a broadcast.
    ///
    /// Returns `true` when the same key was seen within the TTL. A
    /// fresh key is recorded; the oldest keys are evicted once the set
    /// exceeds its size bound.
    pub fn is_duplicate(
        &self,
        channel: &str,
        event: &str,
        data: &Value,
        explicit: Option<&str>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }

        let key = dedup_key(channel, event, data, explicit);
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("dedup lock poisoned");

        if let Some(&inserted) = inner.seen.get(&key) {
            if now.duration_since(inserted) <= self.config.ttl {
                return true;
            }
        }

        inner.seen.insert(key.clone(), now);
        inner.order.push_back((key, now));

        while inner.seen.len() > self.config.max_size {
            let Some((old_key, inserted)) = inner.order.pop_front() else {
                break;
            };
            // Only drop the key if this order entry is still current.
            if inner.seen.get(&old_key) == Some(&inserted) {
                inner.seen.remove(&old_key);
            }
        }

        false
    }

    /// Drop expired keys.
    pub fn sweep(&self) {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut inner = self.inner.lock().expect("dedup lock poisoned");
        inner
            .seen
            .retain(|_, inserted| now.duration_since(*inserted) <= ttl);
        let seen = std::mem::take(&mut inner.seen);
        inner
            .order
            .retain(|(key, inserted)| seen.get(key) == Some(inserted));
        inner.seen = seen;
    }

    /// Number of remembered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedup lock poisoned").seen.len()
    }

    /// Whether the seen set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
