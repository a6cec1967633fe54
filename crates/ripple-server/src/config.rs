//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RIPPLE_*)
//! - TOML configuration file (`RIPPLE_CONFIG`, `ripple.toml`, or the
//!   usual system paths)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection and listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Cross-node relay settings.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Upgrade-time authentication.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Inbound message rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Payload checks and sanitization.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Message acknowledgment tracking.
    #[serde(default)]
    pub acknowledgments: AckConfig,

    /// Presence heartbeat sweeping.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Webhook emission.
    #[serde(default)]
    pub webhooks: WebhookConfig,

    /// Recent-message history.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Broadcast deduplication.
    #[serde(default)]
    pub deduplication: DedupConfig,

    /// Connection and subscription load management.
    #[serde(default)]
    pub load: LoadConfig,

    /// Circuit breakers around external calls.
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    /// Metrics export.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Listener and per-connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds without inbound frames before a socket is closed. Also
    /// advertised as `activity_timeout` in `connection_established`.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Send protocol-level pings to keep intermediaries alive.
    #[serde(default = "default_true")]
    pub send_pings: bool,

    /// Interval between server pings, seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Replay envelopes that carry our own node id (loopback guard
    /// override; leave off unless you know why you need it).
    #[serde(default)]
    pub publish_to_self: bool,

    /// Maximum channels per batch request.
    #[serde(default = "default_max_batch")]
    pub max_batch_size: usize,
}

/// Relay (Redis) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_relay_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub database: i64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Upgrade-time authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    /// HMAC secret for token verification.
    #[serde(default)]
    pub secret: Option<String>,

    /// Cookie consulted when no Authorization header is present.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

/// Rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Messages admitted per window. Zero disables limiting.
    #[serde(default = "default_rate_max")]
    pub max: u32,

    /// Window length, milliseconds.
    #[serde(default = "default_rate_window")]
    pub window_ms: u64,

    #[serde(default)]
    pub per_channel: bool,

    #[serde(default)]
    pub per_user: bool,
}

/// Payload security settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Maximum inbound frame size, bytes.
    #[serde(default = "default_max_payload")]
    pub max_payload_size: usize,

    /// Escape HTML-sensitive characters in client payloads.
    #[serde(default = "default_true")]
    pub sanitize_messages: bool,

    /// CORS for the HTTP endpoints.
    #[serde(default)]
    pub cors: CorsConfig,
}

/// CORS settings for the HTTP surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Allowed origins; empty means any.
    #[serde(default)]
    pub origins: Vec<String>,
}

/// Acknowledgment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-attempt timeout, milliseconds.
    #[serde(default = "default_ack_timeout")]
    pub timeout_ms: u64,

    /// Total delivery attempts.
    #[serde(default = "default_ack_retries")]
    pub retry_attempts: u32,
}

/// Presence heartbeat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sweep interval, milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Silence past this is evicted, milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// A webhook endpoint registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub url: String,

    /// Event names delivered to this endpoint; empty matches all.
    #[serde(default)]
    pub events: Vec<String>,

    /// Extra request headers.
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

/// Webhook emitter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub endpoints: Vec<WebhookEndpoint>,

    #[serde(default = "default_webhook_retries")]
    pub retry_attempts: u32,

    /// Base retry delay, milliseconds; attempt N waits N times this.
    #[serde(default = "default_webhook_delay")]
    pub retry_delay_ms: u64,

    /// Request timeout, milliseconds.
    #[serde(default = "default_webhook_timeout")]
    pub timeout_ms: u64,

    /// HMAC secret; bodies are signed when present.
    #[serde(default)]
    pub secret: Option<String>,
}

/// History settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Message retention, seconds.
    #[serde(default = "default_history_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_history_max")]
    pub max_messages: usize,

    /// Event names never stored.
    #[serde(default)]
    pub exclude_events: Vec<String>,
}

/// Deduplication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seen-key lifetime, milliseconds.
    #[serde(default = "default_dedup_ttl")]
    pub ttl_ms: u64,

    #[serde(default = "default_dedup_max")]
    pub max_size: usize,
}

/// Load manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_max_channels_per_connection")]
    pub max_channels_per_connection: usize,

    #[serde(default = "default_max_global_channels")]
    pub max_global_channels: usize,

    /// Utilization fraction at which admission stops.
    #[serde(default = "default_shed_load_at")]
    pub shed_load_at: f64,

    /// Per-socket buffered bytes before non-critical frames are shed.
    #[serde(default = "default_backpressure")]
    pub backpressure_threshold: usize,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    #[serde(default = "default_failure_window")]
    pub failure_window_ms: u64,

    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_ms: u64,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: usize,

    #[serde(default = "default_breaker_timeout")]
    pub timeout_ms: u64,
}

/// Metrics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// Default value functions

fn default_host() -> String {
    std::env::var("RIPPLE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RIPPLE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_ping_interval() -> u64 {
    30
}

fn default_max_batch() -> usize {
    50
}

fn default_relay_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "broadcasting:".to_string()
}

fn default_cookie_name() -> String {
    "ripple_token".to_string()
}

fn default_rate_max() -> u32 {
    100
}

fn default_rate_window() -> u64 {
    60_000
}

fn default_max_payload() -> usize {
    64 * 1024
}

fn default_ack_timeout() -> u64 {
    5_000
}

fn default_ack_retries() -> u32 {
    3
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> u64 {
    120_000
}

fn default_webhook_retries() -> u32 {
    3
}

fn default_webhook_delay() -> u64 {
    1_000
}

fn default_webhook_timeout() -> u64 {
    10_000
}

fn default_history_ttl() -> u64 {
    3_600
}

fn default_history_max() -> usize {
    100
}

fn default_dedup_ttl() -> u64 {
    300_000
}

fn default_dedup_max() -> usize {
    10_000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_channels_per_connection() -> usize {
    100
}

fn default_max_global_channels() -> usize {
    10_000
}

fn default_shed_load_at() -> f64 {
    0.90
}

fn default_backpressure() -> usize {
    1024 * 1024
}

fn default_failure_threshold() -> usize {
    5
}

fn default_failure_window() -> u64 {
    60_000
}

fn default_reset_timeout() -> u64 {
    30_000
}

fn default_success_threshold() -> usize {
    2
}

fn default_breaker_timeout() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            idle_timeout_secs: default_idle_timeout(),
            send_pings: true,
            ping_interval_secs: default_ping_interval(),
            publish_to_self: false,
            max_batch_size: default_max_batch(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_relay_port(),
            password: None,
            database: 0,
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: None,
            cookie_name: default_cookie_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max: default_rate_max(),
            window_ms: default_rate_window(),
            per_channel: false,
            per_user: false,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_payload_size: default_max_payload(),
            sanitize_messages: true,
            cors: CorsConfig::default(),
        }
    }
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_ack_timeout(),
            retry_attempts: default_ack_retries(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoints: Vec::new(),
            retry_attempts: default_webhook_retries(),
            retry_delay_ms: default_webhook_delay(),
            timeout_ms: default_webhook_timeout(),
            secret: None,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_history_ttl(),
            max_messages: default_history_max(),
            exclude_events: Vec::new(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: default_dedup_ttl(),
            max_size: default_dedup_max(),
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_channels_per_connection: default_max_channels_per_connection(),
            max_global_channels: default_max_global_channels(),
            shed_load_at: default_shed_load_at(),
            backpressure_threshold: default_backpressure(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window(),
            reset_timeout_ms: default_reset_timeout(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_breaker_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from the first config file found, falling
    /// back to defaults with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("RIPPLE_CONFIG") {
            return Self::from_file(&path);
        }

        let config_paths = [
            "ripple.toml",
            "/etc/ripple/ripple.toml",
            "~/.config/ripple/ripple.toml",
        ];
        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// The socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host/port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .with_context(|| {
                format!(
                    "Invalid listen address {}:{}",
                    self.server.host, self.server.port
                )
            })
    }
}

impl RateLimitConfig {
    /// Bridge to the guard crate's config type.
    #[must_use]
    pub fn to_guard(&self) -> ripple_guard::RateLimitConfig {
        ripple_guard::RateLimitConfig {
            max: self.max,
            window: Duration::from_millis(self.window_ms),
            per_channel: self.per_channel,
            per_user: self.per_user,
        }
    }
}

impl AckConfig {
    /// Bridge to the guard crate's config type.
    #[must_use]
    pub fn to_guard(&self) -> ripple_guard::AckConfig {
        ripple_guard::AckConfig {
            enabled: self.enabled,
            timeout: Duration::from_millis(self.timeout_ms),
            retry_attempts: self.retry_attempts,
        }
    }
}

impl DedupConfig {
    /// Bridge to the guard crate's config type.
    #[must_use]
    pub fn to_guard(&self) -> ripple_guard::DedupConfig {
        ripple_guard::DedupConfig {
            enabled: self.enabled,
            ttl: Duration::from_millis(self.ttl_ms),
            max_size: self.max_size,
        }
    }
}

impl LoadConfig {
    /// Bridge to the guard crate's config type.
    #[must_use]
    pub fn to_guard(&self) -> ripple_guard::LoadConfig {
        ripple_guard::LoadConfig {
            max_connections: self.max_connections,
            max_channels_per_connection: self.max_channels_per_connection,
            max_global_channels: self.max_global_channels,
            shed_load_at: self.shed_load_at,
            backpressure_threshold: self.backpressure_threshold,
        }
    }
}

impl BreakerConfig {
    /// Bridge to the guard crate's config type.
    #[must_use]
    pub fn to_guard(&self) -> ripple_guard::BreakerConfig {
        ripple_guard::BreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_window: Duration::from_millis(self.failure_window_ms),
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            success_threshold: self.success_threshold,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

impl PersistenceConfig {
    /// Bridge to the core crate's config type.
    #[must_use]
    pub fn to_core(&self) -> ripple_core::HistoryConfig {
        ripple_core::HistoryConfig {
            max_messages: self.max_messages,
            ttl: Duration::from_secs(self.ttl_secs),
            exclude_events: self.exclude_events.clone(),
        }
    }
}

impl RelayConfig {
    /// Bridge to the relay crate's config type.
    #[must_use]
    pub fn to_relay(&self) -> ripple_relay::RelayConfig {
        ripple_relay::RelayConfig {
            host: self.host.clone(),
            port: self.port,
            password: self.password.clone(),
            database: self.database,
            key_prefix: self.key_prefix.clone(),
        }
    }
}
