//! Payload sanitization.
//!
//! Recursively escapes HTML-sensitive characters in every string leaf
//! of a payload. Non-string leaves pass through unchanged. The escape
//! set deliberately excludes `&` so the transform is idempotent.

use serde_json::Value;

/// Escape HTML-sensitive characters in a single string.
#[must_use]
pub fn sanitize_str(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            other => out.push(other),
        }
    }
    out
}

/// Sanitize a payload in place, walking arrays and objects.
pub fn sanitize_value(value: &mut Value) {
    match value {
        Value::String(s) => *s = sanitize_str(s),
        Value::Array(items) => {
            for item in items {
                sanitize_value(item);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                sanitize_value(item);
            }
        }
        _ => {}
    }
}
