//! Cross-node relay envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind tag of a relay envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// A channel broadcast to replay on the receiving node.
    Broadcast,
}

/// A message relayed between nodes.
///
/// `server_id` names the originating node; envelopes that come back
/// carrying our own id are dropped on the inbound path, which is the
/// invariant that prevents echo storms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub channel: String,
    pub event: String,
    pub data: Value,
    /// Socket excluded from fan-out on the receiving node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<String>,
    /// Originating node.
    pub server_id: String,
}

impl RelayEnvelope {
    /// Build a broadcast envelope.
    #[must_use]
    pub fn broadcast(
        channel: impl Into<String>,
        event: impl Into<String>,
        data: Value,
        socket_id: Option<String>,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Broadcast,
            channel: channel.into(),
            event: event.into(),
            data,
            socket_id,
            server_id: server_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let envelope = RelayEnvelope::broadcast("news", "e", json!({"a": 1}), None, "node-1");
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "broadcast");
        assert_eq!(value["server_id"], "node-1");
        assert!(value.get("socket_id").is_none());

        let back: RelayEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_socket_id_round_trips() {
        let envelope =
            RelayEnvelope::broadcast("news", "e", json!(null), Some("s1".into()), "node-2");
        let text = serde_json::to_string(&envelope).unwrap();
        let back: RelayEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.socket_id.as_deref(), Some("s1"));
    }
}
