//! Channel name patterns for authorization rules.
//!
//! A pattern is a literal channel name with `{var}` placeholders, each
//! binding exactly one dot-free segment. `private-user.{userId}`
//! matches `private-user.123` and extracts `userId = "123"`.

use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while compiling a pattern.
#[derive(Debug, Error)]
pub enum PatternError {
    /// A `{` without a matching `}`.
    #[error("Unclosed '{{' in pattern: {0}")]
    UnclosedBrace(String),

    /// A `{}` with no name inside.
    #[error("Empty parameter name in pattern: {0}")]
    EmptyName(String),

    /// Parameter names must be valid identifiers.
    #[error("Invalid parameter name '{0}'")]
    InvalidName(String),

    /// The same parameter name appears twice.
    #[error("Duplicate parameter name '{0}'")]
    DuplicateName(String),

    /// The assembled expression failed to compile.
    #[error("Pattern compilation failed: {0}")]
    Regex(#[from] regex::Error),
}

fn valid_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A compiled channel pattern.
#[derive(Debug, Clone)]
pub struct ChannelPattern {
    raw: String,
    regex: Regex,
    params: Vec<String>,
}

impl ChannelPattern {
    /// Compile a pattern.
    ///
    /// Literal portions are regex-escaped; each `{name}` becomes a
    /// named group matching one `[^.]+` segment. The expression is
    /// anchored on both ends.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] for malformed placeholders or an
    /// uncompilable expression.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let mut expr = String::with_capacity(pattern.len() + 16);
        let mut params = Vec::new();
        expr.push('^');

        let mut rest = pattern;
        while let Some(open) = rest.find('{') {
            expr.push_str(&regex::escape(&rest[..open]));
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| PatternError::UnclosedBrace(pattern.to_string()))?;
            let name = &after[..close];

            if name.is_empty() {
                return Err(PatternError::EmptyName(pattern.to_string()));
            }
            if !valid_param_name(name) {
                return Err(PatternError::InvalidName(name.to_string()));
            }
            if params.iter().any(|p| p == name) {
                return Err(PatternError::DuplicateName(name.to_string()));
            }

            expr.push_str(&format!("(?P<{name}>[^.]+)"));
            params.push(name.to_string());
            rest = &after[close + 1..];
        }
        expr.push_str(&regex::escape(rest));
        expr.push('$');

        Ok(Self {
            raw: pattern.to_string(),
            regex: Regex::new(&expr)?,
            params,
        })
    }

    /// The original pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parameter names, in order of appearance.
    #[must_use]
    pub fn param_names(&self) -> &[String] {
        &self.params
    }

    /// Test whether a channel name matches the full pattern.
    #[must_use]
    pub fn matches(&self, channel: &str) -> bool {
        self.regex.is_match(channel)
    }

    /// Match a channel name and extract named parameters.
    ///
    /// Returns `None` when the name does not match.
    #[must_use]
    pub fn extract(&self, channel: &str) -> Option<HashMap<String, String>> {
        let captures = self.regex.captures(channel)?;
        let mut out = HashMap::with_capacity(self.params.len());
        for name in &self.params {
            if let Some(m) = captures.name(name) {
                out.insert(name.clone(), m.as_str().to_string());
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_pattern() {
        let pattern = ChannelPattern::compile("news").unwrap();
        assert!(pattern.matches("news"));
        assert!(!pattern.matches("news.local"));
        assert!(!pattern.matches("breaking-news"));
        assert_eq!(pattern.extract("news"), Some(HashMap::new()));
    }

    #[test]
    fn test_single_parameter() {
        let pattern = ChannelPattern::compile("private-user.{userId}").unwrap();

        let params = pattern.extract("private-user.123").unwrap();
        assert_eq!(params.get("userId").map(String::as_str), Some("123"));

        // A parameter binds exactly one dot-free segment.
        assert!(!pattern.matches("private-user.1.2"));
        assert!(!pattern.matches("private-user."));
    }

    #[test]
    fn test_multiple_parameters() {
        let pattern = ChannelPattern::compile("presence-{org}.room.{roomId}").unwrap();

        let params = pattern.extract("presence-acme.room.7").unwrap();
        assert_eq!(params.get("org").map(String::as_str), Some("acme"));
        assert_eq!(params.get("roomId").map(String::as_str), Some("7"));
    }

    #[test]
    fn test_metacharacters_are_literal() {
        let pattern = ChannelPattern::compile("private-a+b.{id}").unwrap();
        assert!(pattern.matches("private-a+b.1"));
        assert!(!pattern.matches("private-aab.1"));
    }

    #[test]
    fn test_round_trip_substitution() {
        let pattern = ChannelPattern::compile("presence-chat.{roomId}.{shard}").unwrap();
        let cases = [("lobby", "0"), ("ops-team", "42"), ("x_y", "z9")];

        for (room, shard) in cases {
            let channel = format!("presence-chat.{room}.{shard}");
            let params = pattern.extract(&channel).unwrap();
            assert_eq!(params.get("roomId").map(String::as_str), Some(room));
            assert_eq!(params.get("shard").map(String::as_str), Some(shard));
        }
    }

    #[test]
    fn test_compile_errors() {
        assert!(matches!(
            ChannelPattern::compile("private-{"),
            Err(PatternError::UnclosedBrace(_))
        ));
        assert!(matches!(
            ChannelPattern::compile("private-{}"),
            Err(PatternError::EmptyName(_))
        ));
        assert!(matches!(
            ChannelPattern::compile("private-{9bad}"),
            Err(PatternError::InvalidName(_))
        ));
        assert!(matches!(
            ChannelPattern::compile("a.{id}.{id}"),
            Err(PatternError::DuplicateName(_))
        ));
    }
}
