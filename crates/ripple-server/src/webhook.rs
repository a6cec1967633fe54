//! Best-effort webhook emission.
//!
//! Matching endpoints receive a JSON body `{event, timestamp, data,
//! signature?}` with linear-backoff retries on 5xx and transport
//! errors. 4xx responses are never retried. Failures never reach the
//! caller.

use crate::config::{WebhookConfig, WebhookEndpoint};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Webhook event names.
pub mod events {
    pub const CHANNEL_OCCUPIED: &str = "channel_occupied";
    pub const CHANNEL_VACATED: &str = "channel_vacated";
    pub const MEMBER_ADDED: &str = "member_added";
    pub const MEMBER_REMOVED: &str = "member_removed";
    pub const CLIENT_EVENT: &str = "client_event";
}

fn sign_body(secret: &str, body: &Value) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body.to_string().as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Fire-and-forget webhook emitter.
pub struct WebhookEmitter {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookEmitter {
    /// Create an emitter.
    #[must_use]
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Whether any endpoint would receive this event.
    #[must_use]
    pub fn wants(&self, event: &str) -> bool {
        self.config.enabled
            && self
                .config
                .endpoints
                .iter()
                .any(|e| e.events.is_empty() || e.events.iter().any(|name| name == event))
    }

    /// Deliver an event to every matching endpoint, in the background.
    pub fn dispatch(&self, event: &str, data: Value) {
        if !self.config.enabled {
            return;
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut body = serde_json::json!({
            "event": event,
            "timestamp": timestamp,
            "data": data,
        });
        if let Some(secret) = self.config.secret.as_deref() {
            if let Some(signature) = sign_body(secret, &body) {
                body["signature"] = Value::from(signature);
            }
        }

        for endpoint in &self.config.endpoints {
            let matches =
                endpoint.events.is_empty() || endpoint.events.iter().any(|name| name == event);
            if !matches {
                continue;
            }

            let client = self.client.clone();
            let endpoint = endpoint.clone();
            let body = body.clone();
            let retry_attempts = self.config.retry_attempts.max(1);
            let retry_delay = Duration::from_millis(self.config.retry_delay_ms);
            tokio::spawn(async move {
                deliver(client, endpoint, body, retry_attempts, retry_delay).await;
            });
        }
    }
}

async fn deliver(
    client: reqwest::Client,
    endpoint: WebhookEndpoint,
    body: Value,
    retry_attempts: u32,
    retry_delay: Duration,
) {
    for attempt in 1..=retry_attempts {
        let mut request = client.post(&endpoint.url).json(&body);
        for (name, value) in &endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %endpoint.url, attempt, "Webhook delivered");
                return;
            }
            Ok(response) if response.status().is_client_error() => {
                warn!(url = %endpoint.url, status = %response.status(), "Webhook rejected, not retrying");
                return;
            }
            Ok(response) => {
                warn!(url = %endpoint.url, status = %response.status(), attempt, "Webhook failed");
            }
            Err(e) => {
                warn!(url = %endpoint.url, error = %e, attempt, "Webhook request error");
            }
        }

        if attempt < retry_attempts {
            tokio::time::sleep(retry_delay * attempt).await;
        }
    }
    warn!(url = %endpoint.url, "Webhook retry budget exhausted, dropping event");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(endpoints: Vec<WebhookEndpoint>) -> WebhookConfig {
        WebhookConfig {
            enabled: true,
            endpoints,
            retry_attempts: 3,
            retry_delay_ms: 10,
            timeout_ms: 1000,
            secret: Some("hook-secret".to_string()),
        }
    }

    fn endpoint(events: Vec<&str>) -> WebhookEndpoint {
        WebhookEndpoint {
            url: "http://127.0.0.1:9/unreachable".to_string(),
            events: events.into_iter().map(String::from).collect(),
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_event_matching() {
        let emitter = WebhookEmitter::new(config(vec![endpoint(vec!["member_added"])]));
        assert!(emitter.wants("member_added"));
        assert!(!emitter.wants("client_event"));

        let catch_all = WebhookEmitter::new(config(vec![endpoint(vec![])]));
        assert!(catch_all.wants("anything"));
    }

    #[test]
    fn test_disabled_wants_nothing() {
        let emitter = WebhookEmitter::new(WebhookConfig::default());
        assert!(!emitter.wants("member_added"));
    }

    #[test]
    fn test_signature_is_stable() {
        let body = serde_json::json!({"event": "e", "timestamp": 1, "data": {}});
        let a = sign_body("secret", &body).unwrap();
        let b = sign_body("secret", &body).unwrap();
        assert_eq!(a, b);
        assert_ne!(sign_body("other", &body).unwrap(), a);
    }

    #[tokio::test]
    async fn test_dispatch_to_unreachable_does_not_panic() {
        let emitter = WebhookEmitter::new(config(vec![endpoint(vec![])]));
        emitter.dispatch("member_added", serde_json::json!({"channel": "x"}));
        // Delivery happens in the background and must swallow errors.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
