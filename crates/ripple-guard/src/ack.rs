//! Outstanding-message acknowledgment tracking.
//!
//! Messages sent with an ack request are tracked until the client
//! acknowledges them. A single sweeper task watches a deadline heap
//! instead of arming one timer per message; on each per-attempt
//! timeout the message is re-sent until the retry budget runs out.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Acknowledgment configuration.
#[derive(Debug, Clone)]
pub struct AckConfig {
    /// Whether tracking is active. Disabled mode resolves immediately.
    pub enabled: bool,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Total delivery attempts before the message fails.
    pub retry_attempts: u32,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(5),
            retry_attempts: 3,
        }
    }
}

/// Why a tracked message failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckError {
    /// The client never acknowledged within the retry budget.
    #[error("timeout after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// The manager was cleared (server stop).
    #[error("cleared")]
    Cleared,
}

/// A re-send request emitted when an attempt times out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRetry {
    pub message_id: String,
    pub socket_id: String,
    /// The rendered frame to deliver again, unchanged.
    pub text: String,
    /// The attempt number this re-send starts.
    pub attempt: u32,
}

/// Awaitable resolution of one tracked message.
pub struct AckHandle {
    receiver: oneshot::Receiver<Result<(), AckError>>,
}

impl AckHandle {
    /// Wait for the ack, a timeout, or a clear.
    pub async fn wait(self) -> Result<(), AckError> {
        self.receiver.await.unwrap_or(Err(AckError::Cleared))
    }
}

struct Pending {
    socket_id: String,
    text: String,
    attempts: u32,
    deadline: Instant,
    resolver: oneshot::Sender<Result<(), AckError>>,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, Pending>,
    /// Deadline heap with lazy deletion: stale entries are skipped
    /// when their deadline no longer matches the pending record.
    deadlines: BinaryHeap<Reverse<(Instant, String)>>,
}

/// Tracks outstanding messages and their retry deadlines.
pub struct AckManager {
    inner: Mutex<Inner>,
    notify: Notify,
    retry_tx: mpsc::UnboundedSender<AckRetry>,
    config: AckConfig,
}

impl AckManager {
    /// Create a manager and the stream of re-send requests its
    /// sweeper emits.
    #[must_use]
    pub fn new(config: AckConfig) -> (Self, mpsc::UnboundedReceiver<AckRetry>) {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Mutex::new(Inner::default()),
                notify: Notify::new(),
                retry_tx,
                config,
            },
            retry_rx,
        )
    }

    /// Track a message sent to `socket_id` and return its resolution
    /// handle. In disabled mode the handle resolves immediately.
    #[must_use]
    pub fn register(
        &self,
        message_id: impl Into<String>,
        socket_id: impl Into<String>,
        text: impl Into<String>,
    ) -> AckHandle {
        let (tx, rx) = oneshot::channel();

        if !self.config.enabled {
            let _ = tx.send(Ok(()));
            return AckHandle { receiver: rx };
        }

        let message_id = message_id.into();
        let deadline = Instant::now() + self.config.timeout;
        {
            let mut inner = self.inner.lock().expect("ack lock poisoned");
            inner.pending.insert(
                message_id.clone(),
                Pending {
                    socket_id: socket_id.into(),
                    text: text.into(),
                    attempts: 1,
                    deadline,
                    resolver: tx,
                },
            );
            inner.deadlines.push(Reverse((deadline, message_id)));
        }
        self.notify.notify_one();

        AckHandle { receiver: rx }
    }

    /// Resolve a tracked message.
    ///
    /// Returns `false` when no such message is pending.
    pub fn acknowledge(&self, message_id: &str) -> bool {
        let entry = {
            let mut inner = self.inner.lock().expect("ack lock poisoned");
            inner.pending.remove(message_id)
        };
        match entry {
            Some(pending) => {
                let _ = pending.resolver.send(Ok(()));
                debug!(message_id = %message_id, "Message acknowledged");
                true
            }
            None => false,
        }
    }

    /// Fail every pending message with [`AckError::Cleared`].
    pub fn clear(&self) {
        let drained: Vec<Pending> = {
            let mut inner = self.inner.lock().expect("ack lock poisoned");
            inner.deadlines.clear();
            inner.pending.drain().map(|(_, p)| p).collect()
        };
        for pending in drained {
            let _ = pending.resolver.send(Err(AckError::Cleared));
        }
    }

    /// Number of messages awaiting acknowledgment.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().expect("ack lock poisoned").pending.len()
    }

    fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock().expect("ack lock poisoned");
        inner.deadlines.peek().map(|Reverse((at, _))| *at)
    }

    /// Handle every due deadline: re-arm and emit a retry while the
    /// budget lasts, fail the message after.
    fn process_due(&self) -> Vec<AckRetry> {
        let now = Instant::now();
        let mut retries = Vec::new();
        let mut failed = Vec::new();

        {
            let mut inner = self.inner.lock().expect("ack lock poisoned");
            while let Some(Reverse((deadline, message_id))) = inner.deadlines.pop() {
                if deadline > now {
                    inner.deadlines.push(Reverse((deadline, message_id)));
                    break;
                }

                let Some(pending) = inner.pending.get(&message_id) else {
                    continue; // already acknowledged
                };
                if pending.deadline != deadline {
                    continue; // stale heap entry from an earlier attempt
                }

                if pending.attempts < self.config.retry_attempts {
                    let pending = inner.pending.get_mut(&message_id).expect("checked above");
                    pending.attempts += 1;
                    pending.deadline = now + self.config.timeout;
                    retries.push(AckRetry {
                        message_id: message_id.clone(),
                        socket_id: pending.socket_id.clone(),
                        text: pending.text.clone(),
                        attempt: pending.attempts,
                    });
                    let deadline = pending.deadline;
                    inner.deadlines.push(Reverse((deadline, message_id)));
                } else {
                    let pending = inner.pending.remove(&message_id).expect("checked above");
                    failed.push((message_id, pending));
                }
            }
        }

        for (message_id, pending) in failed {
            debug!(message_id = %message_id, attempts = pending.attempts, "Ack retry budget exhausted");
            let _ = pending.resolver.send(Err(AckError::Timeout {
                attempts: pending.attempts,
            }));
        }
        retries
    }

    /// Run the deadline sweeper until cancelled.
    pub async fn run_sweeper(&self, cancel: CancellationToken) {
        loop {
            let sleep_until = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.notify.notified() => {}
                () = tokio::time::sleep_until(sleep_until) => {
                    for retry in self.process_due() {
                        let _ = self.retry_tx.send(retry);
                    }
                }
            }
        }
    }
}
