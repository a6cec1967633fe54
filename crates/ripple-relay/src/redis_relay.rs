//! Redis-backed relay adapter.
//!
//! Broadcasts ride Redis pub/sub on `{prefix}{channel}` topics; shared
//! channel sets, presence hashes, connection snapshots, dedup keys,
//! and history windows live under the same prefix with TTLs.

use crate::envelope::RelayEnvelope;
use crate::{RelayAdapter, RelayError, CHANNEL_TTL, CONNECTION_TTL, DEFAULT_KEY_PREFIX};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: i64,
    pub key_prefix: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl RelayConfig {
    /// Connection URL for the redis client.
    #[must_use]
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{password}@{}:{}/{}",
                self.host, self.port, self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Redis relay adapter.
pub struct RedisRelay {
    conn: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisRelay {
    /// Connect to Redis and start the inbound subscription.
    ///
    /// Returns the adapter and the stream of envelopes published by
    /// the fleet (our own included; the hub drops loopbacks).
    ///
    /// # Errors
    ///
    /// Returns an error when the connection or the pattern
    /// subscription fails.
    pub async fn connect(
        config: RelayConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayEnvelope>), RelayError> {
        let client = redis::Client::open(config.url().as_str())?;
        let conn = redis::aio::ConnectionManager::new(client.clone()).await?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{}*", config.key_prefix)).await?;

        info!(host = %config.host, port = config.port, "Relay connected");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Unreadable relay message");
                        continue;
                    }
                };
                match serde_json::from_str::<RelayEnvelope>(&payload) {
                    Ok(envelope) => {
                        if tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Discarding malformed relay envelope"),
                }
            }
            debug!("Relay subscription stream ended");
        });

        Ok((
            Self {
                conn,
                key_prefix: config.key_prefix,
            },
            rx,
        ))
    }

    fn channel_key(&self, channel: &str) -> String {
        format!("{}channels:{channel}", self.key_prefix)
    }

    fn presence_key(&self, channel: &str) -> String {
        format!("{}presence:{channel}", self.key_prefix)
    }

    fn connection_key(&self, socket_id: &str) -> String {
        format!("{}connections:{socket_id}", self.key_prefix)
    }

    fn dedup_key(&self, key: &str) -> String {
        format!("{}dedup:{key}", self.key_prefix)
    }

    fn history_key(&self, channel: &str) -> String {
        format!("{}history:{channel}", self.key_prefix)
    }
}

#[async_trait]
impl RelayAdapter for RedisRelay {
    async fn publish(&self, envelope: &RelayEnvelope) -> Result<(), RelayError> {
        let topic = format!("{}{}", self.key_prefix, envelope.channel);
        let payload = serde_json::to_string(envelope)?;
        let mut con = self.conn.clone();
        let _: i64 = con.publish(topic, payload).await?;
        Ok(())
    }

    async fn store_channel(&self, channel: &str, socket_id: &str) -> Result<(), RelayError> {
        let key = self.channel_key(channel);
        let mut con = self.conn.clone();
        let _: () = con.sadd(&key, socket_id).await?;
        let _: () = con.expire(&key, CHANNEL_TTL.as_secs() as i64).await?;
        Ok(())
    }

    async fn remove_channel(&self, channel: &str, socket_id: &str) -> Result<(), RelayError> {
        let key = self.channel_key(channel);
        let mut con = self.conn.clone();
        let _: () = con.srem(&key, socket_id).await?;
        Ok(())
    }

    async fn store_presence_member(
        &self,
        channel: &str,
        socket_id: &str,
        member: &Value,
    ) -> Result<(), RelayError> {
        let key = self.presence_key(channel);
        let mut con = self.conn.clone();
        let _: () = con.hset(&key, socket_id, member.to_string()).await?;
        let _: () = con.expire(&key, CHANNEL_TTL.as_secs() as i64).await?;
        Ok(())
    }

    async fn remove_presence_member(
        &self,
        channel: &str,
        socket_id: &str,
    ) -> Result<(), RelayError> {
        let key = self.presence_key(channel);
        let mut con = self.conn.clone();
        let _: () = con.hdel(&key, socket_id).await?;
        Ok(())
    }

    async fn store_connection(
        &self,
        socket_id: &str,
        snapshot: &Value,
    ) -> Result<(), RelayError> {
        let key = self.connection_key(socket_id);
        let mut con = self.conn.clone();
        let _: () = con
            .set_ex(&key, snapshot.to_string(), CONNECTION_TTL.as_secs())
            .await?;
        Ok(())
    }

    async fn remove_connection(&self, socket_id: &str) -> Result<(), RelayError> {
        let key = self.connection_key(socket_id);
        let mut con = self.conn.clone();
        let _: () = con.del(&key).await?;
        Ok(())
    }

    async fn check_duplicate(&self, key: &str, ttl: Duration) -> Result<bool, RelayError> {
        let key = self.dedup_key(key);
        let mut con = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut con)
            .await?;
        Ok(set.is_none())
    }

    async fn append_history(
        &self,
        channel: &str,
        entry: &Value,
        timestamp_ms: u64,
        max_messages: usize,
        ttl: Duration,
    ) -> Result<(), RelayError> {
        let key = self.history_key(channel);
        let cutoff = timestamp_ms.saturating_sub(ttl.as_millis() as u64);
        let mut con = self.conn.clone();

        let _: i64 = redis::cmd("ZADD")
            .arg(&key)
            .arg(timestamp_ms)
            .arg(entry.to_string())
            .query_async(&mut con)
            .await?;
        let _: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(0)
            .arg(cutoff)
            .query_async(&mut con)
            .await?;
        let _: i64 = redis::cmd("ZREMRANGEBYRANK")
            .arg(&key)
            .arg(0)
            .arg(-(max_messages as i64) - 1)
            .query_async(&mut con)
            .await?;
        let _: () = con.expire(&key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn fetch_history(
        &self,
        channel: &str,
        since_ms: u64,
        limit: usize,
    ) -> Result<Vec<Value>, RelayError> {
        let key = self.history_key(channel);
        let mut con = self.conn.clone();
        let raw: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&key)
            .arg(format!("({since_ms}"))
            .arg("+inf")
            .arg("LIMIT")
            .arg(0)
            .arg(limit as i64)
            .query_async(&mut con)
            .await?;

        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }

    async fn health_check(&self) -> Result<(), RelayError> {
        let mut con = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut con).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(RelayError::Unavailable(format!(
                "unexpected ping reply: {pong}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let config = RelayConfig::default();
        assert_eq!(config.url(), "redis://127.0.0.1:6379/0");

        let config = RelayConfig {
            password: Some("secret".into()),
            database: 2,
            ..RelayConfig::default()
        };
        assert_eq!(config.url(), "redis://:secret@127.0.0.1:6379/2");
    }

    #[test]
    fn test_default_prefix() {
        let config = RelayConfig::default();
        assert_eq!(config.key_prefix, "broadcasting:");
    }
}
