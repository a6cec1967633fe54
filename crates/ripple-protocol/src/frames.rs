//! Frame types for the Ripple protocol.
//!
//! Frames are UTF-8 JSON text messages. Inbound frames are parsed into
//! the [`ClientFrame`] variants; outbound frames are rendered from
//! [`ServerFrame`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Prefix marking a peer-originated ("whisper") event.
pub const CLIENT_EVENT_PREFIX: &str = "client-";

/// Error kinds surfaced to clients over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    AuthError,
    CapacityError,
    ValidationError,
    PayloadTooLarge,
    RateLimitExceeded,
    NotSupported,
    ServerError,
    BatchError,
}

impl ErrorKind {
    /// Wire name of the error kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthError => "AuthError",
            ErrorKind::CapacityError => "CapacityError",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::PayloadTooLarge => "PayloadTooLarge",
            ErrorKind::RateLimitExceeded => "RateLimitExceeded",
            ErrorKind::NotSupported => "NotSupported",
            ErrorKind::ServerError => "ServerError",
            ErrorKind::BatchError => "BatchError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed client-to-server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Subscribe to a channel.
    Subscribe {
        channel: String,
        channel_data: Option<Value>,
        auth: Option<String>,
    },
    /// Unsubscribe from a channel.
    Unsubscribe { channel: String },
    /// Subscribe to a list of channels in one request.
    BatchSubscribe {
        channels: Vec<String>,
        channel_data: Option<Value>,
    },
    /// Unsubscribe from a list of channels in one request.
    BatchUnsubscribe { channels: Vec<String> },
    /// Liveness probe; answered with `pong`.
    Ping,
    /// Refresh the presence heartbeat for a channel.
    Heartbeat { channel: Option<String> },
    /// Acknowledge a server-tracked message.
    Ack { message_id: String },
    /// Peer-originated event, fanned out without a server round-trip.
    ClientEvent {
        event: String,
        channel: String,
        data: Value,
    },
    /// Any event name the dispatcher has no handler for.
    Unknown { event: String },
}

/// An inbound frame together with its acknowledgment envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub frame: ClientFrame,
    /// Message id supplied by the client, echoed in acks and batch results.
    pub message_id: Option<String>,
    /// Whether the client asked for a receipt ack.
    pub wants_ack: bool,
}

/// Structural parse failure for an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("message must be a JSON object")]
    NotAnObject,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("field {0} must be a string")]
    NotAString(&'static str),
    #[error("field {0} must be an array of strings")]
    NotAStringArray(&'static str),
}

fn str_field(map: &Map<String, Value>, name: &'static str) -> Result<Option<String>, ParseError> {
    match map.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ParseError::NotAString(name)),
    }
}

fn required_str(map: &Map<String, Value>, name: &'static str) -> Result<String, ParseError> {
    str_field(map, name)?.ok_or(ParseError::MissingField(name))
}

fn str_list(map: &Map<String, Value>, name: &'static str) -> Result<Vec<String>, ParseError> {
    let value = map.get(name).ok_or(ParseError::MissingField(name))?;
    let items = value.as_array().ok_or(ParseError::NotAStringArray(name))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or(ParseError::NotAStringArray(name))
        })
        .collect()
}

impl Inbound {
    /// Parse a decoded JSON value into a typed frame.
    ///
    /// Event names that match no known operation land in
    /// [`ClientFrame::Unknown`] so the dispatcher can still honor the
    /// acknowledgment envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] when the structure does not match the
    /// frame's required fields.
    pub fn from_value(value: &Value) -> Result<Self, ParseError> {
        let map = value.as_object().ok_or(ParseError::NotAnObject)?;
        let event = required_str(map, "event")?;

        let message_id = str_field(map, "messageId")?;
        let wants_ack = map.get("ack").and_then(Value::as_bool).unwrap_or(false);

        let channel_data = map
            .get("channel_data")
            .or_else(|| map.get("channelData"))
            .filter(|v| !v.is_null())
            .cloned();

        let frame = match event.as_str() {
            "subscribe" => ClientFrame::Subscribe {
                channel: required_str(map, "channel")?,
                channel_data,
                auth: str_field(map, "auth")?,
            },
            "unsubscribe" => ClientFrame::Unsubscribe {
                channel: required_str(map, "channel")?,
            },
            "batch_subscribe" => ClientFrame::BatchSubscribe {
                channels: str_list(map, "channels")?,
                channel_data,
            },
            "batch_unsubscribe" => ClientFrame::BatchUnsubscribe {
                channels: str_list(map, "channels")?,
            },
            "ping" => ClientFrame::Ping,
            "heartbeat" | "presence_heartbeat" => ClientFrame::Heartbeat {
                channel: str_field(map, "channel")?,
            },
            "ack" => ClientFrame::Ack {
                message_id: required_str(map, "messageId")?,
            },
            name if name.starts_with(CLIENT_EVENT_PREFIX) => ClientFrame::ClientEvent {
                event,
                channel: required_str(map, "channel")?,
                data: map
                    .get("data")
                    .cloned()
                    .ok_or(ParseError::MissingField("data"))?,
            },
            _ => ClientFrame::Unknown { event },
        };

        Ok(Self {
            frame,
            message_id,
            wants_ack,
        })
    }
}

/// Membership summary carried in a presence `subscription_succeeded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    /// Socket-ids of current members.
    pub ids: Vec<String>,
    /// Full socket-id to member-value map.
    pub hash: BTreeMap<String, Value>,
    /// Member count.
    pub count: usize,
}

/// A server-to-client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// First frame on every connection.
    ConnectionEstablished {
        socket_id: String,
        activity_timeout: u64,
    },
    SubscriptionSucceeded {
        channel: String,
        /// Present iff the channel is a presence channel.
        presence: Option<PresenceSnapshot>,
    },
    SubscriptionError {
        channel: String,
        kind: ErrorKind,
        error: String,
        status: u16,
    },
    MemberAdded {
        channel: String,
        member: Value,
    },
    MemberRemoved {
        channel: String,
        member: Value,
    },
    Pong,
    Ack {
        message_id: String,
    },
    Error {
        kind: ErrorKind,
        error: String,
        /// Epoch milliseconds after which the client may retry.
        retry_after: Option<u64>,
    },
    BatchSubscribeResult {
        message_id: String,
        succeeded: Vec<String>,
        failed: BTreeMap<String, String>,
    },
    BatchUnsubscribeResult {
        message_id: String,
        succeeded: Vec<String>,
        failed: BTreeMap<String, String>,
    },
    /// A forwarded application or client event.
    Event {
        event: String,
        channel: String,
        data: Value,
        message_id: Option<String>,
    },
}

impl ServerFrame {
    /// Render the frame as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            ServerFrame::ConnectionEstablished {
                socket_id,
                activity_timeout,
            } => serde_json::json!({
                "event": "connection_established",
                "data": { "socket_id": socket_id, "activity_timeout": activity_timeout },
            }),
            ServerFrame::SubscriptionSucceeded { channel, presence } => match presence {
                Some(snapshot) => serde_json::json!({
                    "event": "subscription_succeeded",
                    "channel": channel,
                    "data": { "presence": snapshot },
                }),
                None => serde_json::json!({
                    "event": "subscription_succeeded",
                    "channel": channel,
                }),
            },
            ServerFrame::SubscriptionError {
                channel,
                kind,
                error,
                status,
            } => serde_json::json!({
                "event": "subscription_error",
                "channel": channel,
                "data": { "type": kind.as_str(), "error": error, "status": status },
            }),
            ServerFrame::MemberAdded { channel, member } => serde_json::json!({
                "event": "member_added",
                "channel": channel,
                "data": member,
            }),
            ServerFrame::MemberRemoved { channel, member } => serde_json::json!({
                "event": "member_removed",
                "channel": channel,
                "data": member,
            }),
            ServerFrame::Pong => serde_json::json!({ "event": "pong" }),
            ServerFrame::Ack { message_id } => serde_json::json!({
                "event": "ack",
                "messageId": message_id,
            }),
            ServerFrame::Error {
                kind,
                error,
                retry_after,
            } => {
                let mut data = serde_json::json!({
                    "type": kind.as_str(),
                    "error": error,
                });
                if let Some(at) = retry_after {
                    data["retryAfter"] = Value::from(*at);
                }
                serde_json::json!({ "event": "error", "data": data })
            }
            ServerFrame::BatchSubscribeResult {
                message_id,
                succeeded,
                failed,
            } => serde_json::json!({
                "event": "batch_subscribe_result",
                "messageId": message_id,
                "data": { "succeeded": succeeded, "failed": failed },
            }),
            ServerFrame::BatchUnsubscribeResult {
                message_id,
                succeeded,
                failed,
            } => serde_json::json!({
                "event": "batch_unsubscribe_result",
                "messageId": message_id,
                "data": { "succeeded": succeeded, "failed": failed },
            }),
            ServerFrame::Event {
                event,
                channel,
                data,
                message_id,
            } => {
                let mut value = serde_json::json!({
                    "event": event,
                    "channel": channel,
                    "data": data,
                });
                if let Some(id) = message_id {
                    value["messageId"] = Value::from(id.clone());
                }
                value
            }
        }
    }

    /// Convenience constructor for a plain error frame.
    #[must_use]
    pub fn error(kind: ErrorKind, error: impl Into<String>) -> Self {
        ServerFrame::Error {
            kind,
            error: error.into(),
            retry_after: None,
        }
    }

    /// Convenience constructor for a forwarded event.
    #[must_use]
    pub fn event(event: impl Into<String>, channel: impl Into<String>, data: Value) -> Self {
        ServerFrame::Event {
            event: event.into(),
            channel: channel.into(),
            data,
            message_id: None,
        }
    }

    /// Whether this frame must bypass backpressure shedding.
    ///
    /// Control frames (subscription results, acks, errors, presence
    /// membership updates) are always delivered; only plain event
    /// fan-out may be dropped on an overloaded socket.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        !matches!(self, ServerFrame::Event { .. })
    }
}
