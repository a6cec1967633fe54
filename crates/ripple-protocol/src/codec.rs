//! Codec for encoding and decoding Ripple frames.
//!
//! The wire format is UTF-8 JSON text, one frame per WebSocket text
//! message. Decoding enforces the configured payload size bound on the
//! raw byte length of the frame, before any parsing happens.

use serde_json::Value;
use thiserror::Error;

use crate::frames::{ParseError, ServerFrame};

/// Default inbound payload bound (64 KiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Errors that can occur while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame exceeds the configured payload bound.
    #[error("Frame size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// The text is not valid JSON.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The JSON does not form a known frame.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Decode an inbound text frame into a JSON value.
///
/// # Errors
///
/// Returns [`CodecError::PayloadTooLarge`] when the raw frame exceeds
/// `max_payload` bytes, or [`CodecError::Json`] when it is not valid
/// JSON. Structural validation happens in the next stage.
pub fn decode(text: &str, max_payload: usize) -> Result<Value, CodecError> {
    let size = text.len();
    if size > max_payload {
        return Err(CodecError::PayloadTooLarge {
            size,
            max: max_payload,
        });
    }
    Ok(serde_json::from_str(text)?)
}

/// Render an outbound frame as JSON text.
#[must_use]
pub fn encode(frame: &ServerFrame) -> String {
    frame.to_value().to_string()
}
