//! Channel types for Ripple.
//!
//! A channel is a named room with a visibility class derived from its
//! name prefix. Presence channels additionally carry a member map.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Reserved prefix for private channels.
pub const PRIVATE_PREFIX: &str = "private-";

/// Reserved prefix for presence channels.
pub const PRESENCE_PREFIX: &str = "presence-";

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Visibility class of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    Public,
    Private,
    Presence,
}

impl ChannelType {
    /// Derive the class from the channel name prefix.
    ///
    /// `presence-` wins over `private-`; every other name is public.
    #[must_use]
    pub fn of(name: &str) -> Self {
        if name.starts_with(PRESENCE_PREFIX) {
            ChannelType::Presence
        } else if name.starts_with(PRIVATE_PREFIX) {
            ChannelType::Private
        } else {
            ChannelType::Public
        }
    }

    /// Whether subscriptions require authorization.
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        !matches!(self, ChannelType::Public)
    }

    /// Whether the channel tracks presence members.
    #[must_use]
    pub fn is_presence(&self) -> bool {
        matches!(self, ChannelType::Presence)
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelType::Public => "public",
            ChannelType::Private => "private",
            ChannelType::Presence => "presence",
        };
        f.write_str(name)
    }
}

/// A channel and its membership state.
#[derive(Debug)]
pub struct Channel {
    name: String,
    channel_type: ChannelType,
    subscribers: HashSet<String>,
    /// Socket-id to presence-member value. Populated only for
    /// presence channels.
    members: HashMap<String, Value>,
}

impl Channel {
    /// Create an empty channel; the class is derived from the name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let channel_type = ChannelType::of(&name);
        Self {
            name,
            channel_type,
            subscribers: HashSet::new(),
            members: HashMap::new(),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the channel class.
    #[must_use]
    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    /// Get the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a socket is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, socket_id: &str) -> bool {
        self.subscribers.contains(socket_id)
    }

    /// Add a subscriber. For presence channels a member value must be
    /// supplied alongside.
    ///
    /// Returns `true` if the socket was not already subscribed.
    pub fn subscribe(&mut self, socket_id: impl Into<String>, member: Option<Value>) -> bool {
        let socket_id = socket_id.into();
        if self.channel_type.is_presence() {
            if let Some(member) = member {
                self.members.insert(socket_id.clone(), member);
            }
        }
        self.subscribers.insert(socket_id)
    }

    /// Remove a subscriber.
    ///
    /// Returns the presence member value that was dropped, if any,
    /// wrapped so callers can distinguish "was not subscribed".
    pub fn unsubscribe(&mut self, socket_id: &str) -> Option<Option<Value>> {
        if !self.subscribers.remove(socket_id) {
            return None;
        }
        Some(self.members.remove(socket_id))
    }

    /// Get a presence member value.
    #[must_use]
    pub fn member(&self, socket_id: &str) -> Option<&Value> {
        self.members.get(socket_id)
    }

    /// Snapshot the presence member map.
    #[must_use]
    pub fn members(&self) -> HashMap<String, Value> {
        self.members.clone()
    }

    /// Get all subscriber ids.
    #[must_use]
    pub fn subscribers(&self) -> Vec<String> {
        self.subscribers.iter().cloned().collect()
    }

    /// Check if the channel has no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
