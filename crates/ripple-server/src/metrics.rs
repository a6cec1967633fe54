//! Metrics collection and export for Ripple.
//!
//! Uses the `metrics` crate for instrumentation; the Prometheus
//! recorder handle renders the text exposition on `GET /metrics`.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "ripple_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "ripple_connections_active";
    pub const MESSAGES_TOTAL: &str = "ripple_messages_total";
    pub const MESSAGES_BYTES: &str = "ripple_messages_bytes";
    pub const CHANNELS_ACTIVE: &str = "ripple_channels_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "ripple_subscriptions_total";
    pub const FRAMES_SHED_TOTAL: &str = "ripple_frames_shed_total";
    pub const RELAY_MESSAGES_TOTAL: &str = "ripple_relay_messages_total";
    pub const RELAY_LOOPBACKS_TOTAL: &str = "ripple_relay_loopbacks_total";
    pub const DUPLICATES_TOTAL: &str = "ripple_duplicates_total";
    pub const ERRORS_TOTAL: &str = "ripple_errors_total";
}

/// Install the Prometheus recorder and describe the metric set.
///
/// Returns `None` when a recorder is already installed (tests) or
/// metrics are disabled.
pub fn install() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;

    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Message bytes processed");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of live channels");
    metrics::describe_counter!(names::SUBSCRIPTIONS_TOTAL, "Channel subscriptions");
    metrics::describe_counter!(
        names::FRAMES_SHED_TOTAL,
        "Frames dropped on congested sockets"
    );
    metrics::describe_counter!(names::RELAY_MESSAGES_TOTAL, "Relay envelopes by direction");
    metrics::describe_counter!(
        names::RELAY_LOOPBACKS_TOTAL,
        "Relay envelopes dropped by the loopback guard"
    );
    metrics::describe_counter!(names::DUPLICATES_TOTAL, "Broadcasts suppressed as duplicates");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors by type");

    info!("Metrics initialized");
    Some(handle)
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a processed message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Update the live channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Record a frame shed by backpressure.
pub fn record_shed() {
    counter!(names::FRAMES_SHED_TOTAL).increment(1);
}

/// Record a relay envelope.
pub fn record_relay(direction: &'static str) {
    counter!(names::RELAY_MESSAGES_TOTAL, "direction" => direction).increment(1);
}

/// Record a loopback-suppressed envelope.
pub fn record_loopback_drop() {
    counter!(names::RELAY_LOOPBACKS_TOTAL).increment(1);
}

/// Record a suppressed duplicate broadcast.
pub fn record_duplicate() {
    counter!(names::DUPLICATES_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
