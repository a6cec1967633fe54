//! # ripple-protocol
//!
//! Wire protocol definitions for the Ripple realtime hub.
//!
//! Frames are UTF-8 JSON text messages exchanged over WebSocket:
//!
//! - [`ClientFrame`] - parsed inbound operations (subscribe, batch
//!   operations, ping, heartbeat, ack, `client-*` events)
//! - [`ServerFrame`] - rendered outbound frames (connection
//!   establishment, subscription results, membership updates, errors)
//! - [`codec`] - decode with size bounds, encode to compact JSON
//! - [`validate`] / [`sanitize`] - structural checks and recursive
//!   string escaping applied before dispatch
//!
//! ## Example
//!
//! ```rust
//! use ripple_protocol::{codec, Inbound, ServerFrame};
//!
//! let value = codec::decode(r#"{"event":"ping"}"#, 1024).unwrap();
//! let inbound = Inbound::from_value(&value).unwrap();
//! assert!(!inbound.wants_ack);
//!
//! let reply = codec::encode(&ServerFrame::Pong);
//! assert_eq!(reply, r#"{"event":"pong"}"#);
//! ```

pub mod codec;
pub mod frames;
pub mod sanitize;
pub mod validate;

pub use codec::{CodecError, DEFAULT_MAX_PAYLOAD};
pub use frames::{
    ClientFrame, ErrorKind, Inbound, ParseError, PresenceSnapshot, ServerFrame,
    CLIENT_EVENT_PREFIX,
};
pub use validate::FrameValidator;
