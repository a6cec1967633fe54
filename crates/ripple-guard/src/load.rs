//! Connection and subscription load management.
//!
//! Counts live connections and (socket, channel) pairs and refuses new
//! work once utilization crosses the shed threshold. The backpressure
//! threshold consulted by per-socket delivery also lives here.

use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Load manager configuration.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// Hard cap on concurrent connections.
    pub max_connections: usize,
    /// Hard cap on subscriptions per socket.
    pub max_channels_per_connection: usize,
    /// Hard cap on live channels across the node.
    pub max_global_channels: usize,
    /// Utilization fraction at which admission stops (0.0 - 1.0).
    pub shed_load_at: f64,
    /// Per-socket buffered-byte level that suppresses non-critical
    /// delivery.
    pub backpressure_threshold: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_channels_per_connection: 100,
            max_global_channels: 10_000,
            shed_load_at: 0.90,
            backpressure_threshold: 1024 * 1024,
        }
    }
}

/// Why work was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The node is at or past the shed threshold.
    #[error("server at capacity")]
    AtCapacity,

    /// The socket holds the maximum number of subscriptions.
    #[error("subscription limit reached for this connection")]
    SocketLimit,
}

/// Tracks node-level load and admits or sheds new work.
pub struct LoadManager {
    connections: AtomicUsize,
    subscriptions: AtomicUsize,
    config: LoadConfig,
}

impl LoadManager {
    /// Create a load manager.
    #[must_use]
    pub fn new(config: LoadConfig) -> Self {
        Self {
            connections: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
            config,
        }
    }

    fn over_threshold(&self, used: usize, max: usize) -> bool {
        max > 0 && (used as f64) >= (max as f64) * self.config.shed_load_at
    }

    /// Decide whether a new connection may be accepted.
    ///
    /// # Errors
    ///
    /// [`LoadError::AtCapacity`] once connection or channel
    /// utilization crosses the shed threshold.
    pub fn admit_connection(&self, channel_count: usize) -> Result<(), LoadError> {
        let connections = self.connections.load(Ordering::Relaxed);
        if self.over_threshold(connections, self.config.max_connections)
            || self.over_threshold(channel_count, self.config.max_global_channels)
        {
            return Err(LoadError::AtCapacity);
        }
        Ok(())
    }

    /// Decide whether a socket may take another subscription.
    ///
    /// # Errors
    ///
    /// [`LoadError::SocketLimit`] at the per-socket cap,
    /// [`LoadError::AtCapacity`] once channel utilization crosses the
    /// shed threshold.
    pub fn admit_subscription(
        &self,
        channel_count: usize,
        socket_subscriptions: usize,
    ) -> Result<(), LoadError> {
        if socket_subscriptions >= self.config.max_channels_per_connection {
            return Err(LoadError::SocketLimit);
        }
        if self.over_threshold(channel_count, self.config.max_global_channels) {
            return Err(LoadError::AtCapacity);
        }
        Ok(())
    }

    /// Record an accepted connection.
    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed connection.
    pub fn connection_closed(&self) {
        let mut current = self.connections.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(1);
            match self.connections.compare_exchange_weak(
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

    /// Record a new subscription pair.
    pub fn subscription_added(&self) {
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record removed subscription pairs.
    pub fn subscriptions_removed(&self, count: usize) {
        let mut current = self.subscriptions.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(count);
            match self.subscriptions.compare_exchange_weak(
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

    /// Current connection count.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Current subscription-pair count.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::Relaxed)
    }

    /// The per-socket buffered-byte level for delivery shedding.
    #[must_use]
    pub fn backpressure_threshold(&self) -> usize {
        self.config.backpressure_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_connections: usize, shed_at: f64) -> LoadManager {
        LoadManager::new(LoadConfig {
            max_connections,
            shed_load_at: shed_at,
            ..LoadConfig::default()
        })
    }

    #[test]
    fn test_connection_admission_threshold() {
        let manager = manager(10, 0.9);

        for _ in 0..8 {
            manager.connection_opened();
        }
        assert!(manager.admit_connection(0).is_ok());

        manager.connection_opened();
        // 9 / 10 >= 0.9 now sheds.
        assert_eq!(manager.admit_connection(0), Err(LoadError::AtCapacity));
    }

    #[test]
    fn test_channel_utilization_also_sheds_connections() {
        let manager = LoadManager::new(LoadConfig {
            max_global_channels: 10,
            shed_load_at: 0.9,
            ..LoadConfig::default()
        });
        assert!(manager.admit_connection(8).is_ok());
        assert_eq!(manager.admit_connection(9), Err(LoadError::AtCapacity));
    }

    #[test]
    fn test_per_socket_cap_is_independent() {
        let manager = LoadManager::new(LoadConfig {
            max_channels_per_connection: 2,
            ..LoadConfig::default()
        });

        assert!(manager.admit_subscription(0, 1).is_ok());
        assert_eq!(
            manager.admit_subscription(0, 2),
            Err(LoadError::SocketLimit)
        );
    }

    #[test]
    fn test_counters_saturate_at_zero() {
        let manager = manager(10, 0.9);
        manager.connection_closed();
        assert_eq!(manager.connection_count(), 0);
        manager.subscriptions_removed(5);
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_counter_roundtrip() {
        let manager = manager(10, 0.9);
        manager.connection_opened();
        manager.subscription_added();
        manager.subscription_added();
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.subscription_count(), 2);

        manager.subscriptions_removed(2);
        manager.connection_closed();
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.subscription_count(), 0);
    }
}
