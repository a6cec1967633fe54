//! Batch gateway: list-wise subscribe, unsubscribe, and broadcast.
//!
//! Partial success is the normal outcome; each result pairs the
//! channels that went through with a reason for each one that did not.

use crate::hub::Hub;
use ripple_core::channel::validate_channel_name;
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-channel outcome lists for a batch request.
pub type BatchOutcome = (Vec<String>, BTreeMap<String, String>);

impl Hub {
    /// Subscribe a socket to a list of channels.
    ///
    /// `channel_data` maps channel names to their presence data. The
    /// list is capped at the configured batch size; channels past the
    /// cap fail with a size reason.
    pub async fn batch_subscribe(
        &self,
        socket_id: &str,
        channels: &[String],
        channel_data: Option<&Value>,
    ) -> BatchOutcome {
        let cap = self.config().server.max_batch_size;
        let mut succeeded = Vec::new();
        let mut failed = BTreeMap::new();

        for (index, channel) in channels.iter().enumerate() {
            if index >= cap {
                failed.insert(
                    channel.clone(),
                    format!("batch size limit of {cap} exceeded"),
                );
                continue;
            }

            let data = channel_data.and_then(|map| map.get(channel));
            match self
                .subscribe_channel(socket_id, channel, data, None, false)
                .await
            {
                Ok(_) => succeeded.push(channel.clone()),
                Err(refusal) => {
                    failed.insert(channel.clone(), refusal.error);
                }
            }
        }

        (succeeded, failed)
    }

    /// Unsubscribe a socket from a list of channels.
    pub async fn batch_unsubscribe(&self, socket_id: &str, channels: &[String]) -> BatchOutcome {
        let cap = self.config().server.max_batch_size;
        let mut succeeded = Vec::new();
        let mut failed = BTreeMap::new();

        for (index, channel) in channels.iter().enumerate() {
            if index >= cap {
                failed.insert(
                    channel.clone(),
                    format!("batch size limit of {cap} exceeded"),
                );
                continue;
            }

            if self.unsubscribe_channel(socket_id, channel).await {
                succeeded.push(channel.clone());
            } else {
                failed.insert(channel.clone(), format!("Not subscribed to channel: {channel}"));
            }
        }

        (succeeded, failed)
    }

    /// Broadcast a list of `(channel, event, data)` triples.
    pub async fn batch_broadcast(&self, items: &[(String, String, Value)]) -> BatchOutcome {
        let cap = self.config().server.max_batch_size;
        let mut succeeded = Vec::new();
        let mut failed = BTreeMap::new();

        for (index, (channel, event, data)) in items.iter().enumerate() {
            if index >= cap {
                failed.insert(
                    channel.clone(),
                    format!("batch size limit of {cap} exceeded"),
                );
                continue;
            }
            if let Err(reason) = validate_channel_name(channel) {
                failed.insert(channel.clone(), reason.to_string());
                continue;
            }

            self.broadcast(channel, event, data.clone(), None).await;
            succeeded.push(channel.clone());
        }

        (succeeded, failed)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::hub::Hub;
    use serde_json::json;

    #[tokio::test]
    async fn test_batch_cap() {
        let mut config = Config::default();
        config.server.max_batch_size = 2;
        let hub = Hub::new(config, None);

        let channels: Vec<String> = (0..4).map(|i| format!("room-{i}")).collect();
        let (succeeded, failed) = hub.batch_subscribe("s1", &channels, None).await;

        assert_eq!(succeeded, vec!["room-0", "room-1"]);
        assert_eq!(failed.len(), 2);
        assert!(failed["room-2"].contains("batch size limit"));
    }

    #[tokio::test]
    async fn test_batch_unsubscribe_reports_unknown() {
        let hub = Hub::new(Config::default(), None);
        hub.batch_subscribe("s1", &["a".to_string()], None).await;

        let (succeeded, failed) = hub
            .batch_unsubscribe("s1", &["a".to_string(), "b".to_string()])
            .await;
        assert_eq!(succeeded, vec!["a"]);
        assert!(failed.contains_key("b"));
    }

    #[tokio::test]
    async fn test_batch_subscribe_per_channel_data() {
        let hub = Hub::new(Config::default(), None);
        hub.authorizer()
            .register_fn("presence-room.{id}", |_| {
                Ok(ripple_core::AuthDecision::Allow)
            })
            .unwrap();

        let channels = vec!["presence-room.1".to_string()];
        let data = json!({"presence-room.1": {"id": "u1", "info": {"name": "A"}}});
        let (succeeded, _) = hub.batch_subscribe("s1", &channels, Some(&data)).await;
        assert_eq!(succeeded.len(), 1);

        let members = hub.registry().members("presence-room.1");
        assert_eq!(members["s1"]["id"], "u1");
    }

    #[tokio::test]
    async fn test_batch_broadcast_rejects_invalid_names() {
        let hub = Hub::new(Config::default(), None);
        let items = vec![
            ("ok".to_string(), "e".to_string(), json!({})),
            ("".to_string(), "e".to_string(), json!({})),
        ];

        let (succeeded, failed) = hub.batch_broadcast(&items).await;
        assert_eq!(succeeded, vec!["ok"]);
        assert!(failed.contains_key(""));
    }
}
