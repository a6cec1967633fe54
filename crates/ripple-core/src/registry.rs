//! Channel registry: the authoritative channel and subscription state.
//!
//! The registry owns both sides of the socket⇄channel link and keeps
//! them symmetric: a socket appears in a channel's subscriber set iff
//! the channel appears in that socket's channel set. Channels exist
//! only while they have subscribers; lifecycle transitions are emitted
//! on the hook bus after the mutation completes.

use crate::channel::{validate_channel_name, Channel, ChannelType};
use crate::hooks::{ChannelEvent, HookBus};
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Socket is not subscribed to the channel.
    #[error("Not subscribed to channel: {0}")]
    NotSubscribed(String),

    /// Socket is already subscribed to the channel.
    #[error("Already subscribed to channel: {0}")]
    AlreadySubscribed(String),
}

/// Result of a successful subscribe.
#[derive(Debug, Clone)]
pub struct SubscribeOutcome {
    /// Presence member value stored for the socket, if any.
    pub member: Option<Value>,
    /// Subscriber count after the mutation.
    pub subscriber_count: usize,
    /// Whether this subscription created the channel.
    pub created: bool,
}

/// Result of a successful unsubscribe.
#[derive(Debug, Clone)]
pub struct UnsubscribeOutcome {
    /// Presence member value removed with the socket, if any.
    pub member: Option<Value>,
    /// Subscriber count after the mutation.
    pub subscriber_count: usize,
    /// Whether the channel emptied and was dropped.
    pub destroyed: bool,
}

/// The channel registry.
pub struct ChannelRegistry {
    /// Channels indexed by name.
    channels: DashMap<String, Channel>,
    /// Socket-id to the set of channels it subscribes to.
    subscriptions: DashMap<String, DashSet<String>>,
    /// Lifecycle hook bus.
    hooks: Arc<HookBus>,
}

impl ChannelRegistry {
    /// Create a registry publishing lifecycle events on `hooks`.
    #[must_use]
    pub fn new(hooks: Arc<HookBus>) -> Self {
        Self {
            channels: DashMap::new(),
            subscriptions: DashMap::new(),
            hooks,
        }
    }

    /// The hook bus lifecycle events are published on.
    #[must_use]
    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    /// Subscribe a socket to a channel.
    ///
    /// Authorization has already happened by the time this is called;
    /// `member` is the presence member value to record for presence
    /// channels.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the socket is
    /// already subscribed.
    pub async fn subscribe(
        &self,
        socket_id: &str,
        channel_name: &str,
        member: Option<Value>,
    ) -> Result<SubscribeOutcome, RegistryError> {
        validate_channel_name(channel_name).map_err(RegistryError::InvalidChannel)?;

        {
            let conn_subs = self
                .subscriptions
                .entry(socket_id.to_string())
                .or_default();
            if !conn_subs.insert(channel_name.to_string()) {
                return Err(RegistryError::AlreadySubscribed(channel_name.to_string()));
            }
        }

        let outcome = {
            let mut entry = self
                .channels
                .entry(channel_name.to_string())
                .or_insert_with(|| Channel::new(channel_name));
            entry.subscribe(socket_id, member);
            let count = entry.subscriber_count();
            SubscribeOutcome {
                member: entry.member(socket_id).cloned(),
                subscriber_count: count,
                // Empty channels are never stored, so a count of one
                // can only mean this subscription created the entry.
                created: count == 1,
            }
        };

        debug!(
            channel = %channel_name,
            socket = %socket_id,
            subscribers = outcome.subscriber_count,
            "Subscribed"
        );

        if outcome.created {
            self.hooks
                .emit(ChannelEvent::Created {
                    channel: channel_name.to_string(),
                })
                .await;
        }
        self.hooks
            .emit(ChannelEvent::Subscribed {
                channel: channel_name.to_string(),
                socket_id: socket_id.to_string(),
                count: outcome.subscriber_count,
            })
            .await;

        Ok(outcome)
    }

    /// Unsubscribe a socket from a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket was not subscribed.
    pub async fn unsubscribe(
        &self,
        socket_id: &str,
        channel_name: &str,
    ) -> Result<UnsubscribeOutcome, RegistryError> {
        let was_linked = match self.subscriptions.get(socket_id) {
            Some(conn_subs) => conn_subs.remove(channel_name).is_some(),
            None => false,
        };
        if !was_linked {
            return Err(RegistryError::NotSubscribed(channel_name.to_string()));
        }
        self.subscriptions
            .remove_if(socket_id, |_, subs| subs.is_empty());

        let outcome = self.detach(socket_id, channel_name)?;
        self.emit_unsubscribe(socket_id, channel_name, &outcome).await;
        Ok(outcome)
    }

    /// Unsubscribe a socket from every channel it is in.
    ///
    /// Returns the affected channels and their outcomes, in snapshot
    /// order.
    pub async fn unsubscribe_all(&self, socket_id: &str) -> Vec<(String, UnsubscribeOutcome)> {
        let channels: Vec<String> = match self.subscriptions.remove(socket_id) {
            Some((_, subs)) => subs.iter().map(|c| c.clone()).collect(),
            None => return Vec::new(),
        };

        let mut outcomes = Vec::with_capacity(channels.len());
        for channel_name in channels {
            if let Ok(outcome) = self.detach(socket_id, &channel_name) {
                self.emit_unsubscribe(socket_id, &channel_name, &outcome).await;
                outcomes.push((channel_name, outcome));
            }
        }

        debug!(socket = %socket_id, channels = outcomes.len(), "Unsubscribed from all channels");
        outcomes
    }

    /// Remove the socket from the channel entry, dropping the entry
    /// when it empties. The subscription link must already be gone.
    fn detach(
        &self,
        socket_id: &str,
        channel_name: &str,
    ) -> Result<UnsubscribeOutcome, RegistryError> {
        let (member, subscriber_count, destroyed) = {
            let mut entry = self
                .channels
                .get_mut(channel_name)
                .ok_or_else(|| RegistryError::NotSubscribed(channel_name.to_string()))?;
            let member = entry
                .unsubscribe(socket_id)
                .ok_or_else(|| RegistryError::NotSubscribed(channel_name.to_string()))?;
            let count = entry.subscriber_count();
            (member, count, entry.is_empty())
        };

        if destroyed {
            self.channels.remove(channel_name);
            debug!(channel = %channel_name, "Dropped empty channel");
        }

        Ok(UnsubscribeOutcome {
            member,
            subscriber_count,
            destroyed,
        })
    }

    async fn emit_unsubscribe(
        &self,
        socket_id: &str,
        channel_name: &str,
        outcome: &UnsubscribeOutcome,
    ) {
        self.hooks
            .emit(ChannelEvent::Unsubscribed {
                channel: channel_name.to_string(),
                socket_id: socket_id.to_string(),
                count: outcome.subscriber_count,
            })
            .await;
        if outcome.destroyed {
            self.hooks
                .emit(ChannelEvent::Empty {
                    channel: channel_name.to_string(),
                })
                .await;
            self.hooks
                .emit(ChannelEvent::Destroyed {
                    channel: channel_name.to_string(),
                })
                .await;
        }
    }

    /// Check if a socket is subscribed to a channel.
    #[must_use]
    pub fn is_subscribed(&self, socket_id: &str, channel_name: &str) -> bool {
        self.channels
            .get(channel_name)
            .map(|c| c.is_subscribed(socket_id))
            .unwrap_or(false)
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn channel_exists(&self, channel_name: &str) -> bool {
        self.channels.contains_key(channel_name)
    }

    /// Subscriber ids of a channel (copy-on-read snapshot).
    #[must_use]
    pub fn subscribers(&self, channel_name: &str) -> Vec<String> {
        self.channels
            .get(channel_name)
            .map(|c| c.subscribers())
            .unwrap_or_default()
    }

    /// Subscriber count of a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel_name: &str) -> usize {
        self.channels
            .get(channel_name)
            .map(|c| c.subscriber_count())
            .unwrap_or(0)
    }

    /// Presence member map of a channel.
    #[must_use]
    pub fn members(&self, channel_name: &str) -> HashMap<String, Value> {
        self.channels
            .get(channel_name)
            .map(|c| c.members())
            .unwrap_or_default()
    }

    /// A single presence member value.
    #[must_use]
    pub fn member(&self, channel_name: &str, socket_id: &str) -> Option<Value> {
        self.channels
            .get(channel_name)
            .and_then(|c| c.member(socket_id).cloned())
    }

    /// Channels a socket is subscribed to.
    #[must_use]
    pub fn socket_channels(&self, socket_id: &str) -> Vec<String> {
        self.subscriptions
            .get(socket_id)
            .map(|subs| subs.iter().map(|c| c.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of subscriptions held by a socket.
    #[must_use]
    pub fn socket_subscription_count(&self, socket_id: &str) -> usize {
        self.subscriptions
            .get(socket_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// All channel names.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of live channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Total (socket, channel) subscription pairs.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.iter().map(|e| e.len()).sum()
    }

    /// The class of a channel name.
    #[must_use]
    pub fn channel_type(name: &str) -> ChannelType {
        ChannelType::of(name)
    }
}
