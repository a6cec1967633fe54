//! Structural validation of inbound frames.
//!
//! The default validators enforce the shape every frame must have
//! before dispatch; user validators can be appended for
//! deployment-specific rules. All registered validators must pass.

use serde_json::Value;

/// Maximum accepted length for an event name.
pub const MAX_EVENT_NAME_LENGTH: usize = 100;

/// A single validation rule. Returns a human-readable reason on failure.
pub type ValidatorFn = Box<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

fn valid_event_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn check_shape(value: &Value) -> Result<(), String> {
    let map = value
        .as_object()
        .ok_or_else(|| "message must be a JSON object".to_string())?;

    match map.get("event") {
        Some(Value::String(_)) => Ok(()),
        Some(_) => Err("event must be a string".to_string()),
        None => Err("event is required".to_string()),
    }
}

fn check_channel(value: &Value) -> Result<(), String> {
    match value.get("channel") {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
        Some(_) => Err("channel must be a string".to_string()),
    }
}

fn check_event_name(value: &Value) -> Result<(), String> {
    let Some(event) = value.get("event").and_then(Value::as_str) else {
        return Ok(()); // shape validator already rejected it
    };

    if event.is_empty() {
        return Err("event must not be empty".to_string());
    }
    if event.len() > MAX_EVENT_NAME_LENGTH {
        return Err(format!(
            "event exceeds {MAX_EVENT_NAME_LENGTH} characters"
        ));
    }
    if !event.chars().all(valid_event_char) {
        return Err("event contains invalid characters".to_string());
    }
    Ok(())
}

/// Ordered chain of frame validators.
pub struct FrameValidator {
    validators: std::sync::RwLock<Vec<ValidatorFn>>,
}

impl FrameValidator {
    /// Create a validator with the default rule set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            validators: std::sync::RwLock::new(vec![
                Box::new(check_shape),
                Box::new(check_channel),
                Box::new(check_event_name),
            ]),
        }
    }

    /// Append a user validator. Runs after the defaults, in
    /// registration order.
    pub fn push(&self, validator: ValidatorFn) {
        self.validators
            .write()
            .expect("validator lock poisoned")
            .push(validator);
    }

    /// Run every validator against the decoded frame.
    ///
    /// # Errors
    ///
    /// Returns the first failing validator's reason.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        let validators = self.validators.read().expect("validator lock poisoned");
        for validator in validators.iter() {
            validator(value)?;
        }
        Ok(())
    }
}

impl Default for FrameValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accepts_well_formed_frames() {
        let validator = FrameValidator::new();
        assert!(validator.check(&json!({"event": "ping"})).is_ok());
        assert!(validator
            .check(&json!({"event": "client-typing", "channel": "private-x"}))
            .is_ok());
        assert!(validator
            .check(&json!({"event": "order.created_v2"}))
            .is_ok());
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let validator = FrameValidator::new();
        assert!(validator.check(&json!(["event"])).is_err());
        assert!(validator.check(&json!({"channel": "x"})).is_err());
        assert!(validator.check(&json!({"event": 7})).is_err());
        assert!(validator
            .check(&json!({"event": "e", "channel": 1}))
            .is_err());
    }

    #[test]
    fn test_rejects_bad_event_names() {
        let validator = FrameValidator::new();
        assert!(validator.check(&json!({"event": ""})).is_err());
        assert!(validator.check(&json!({"event": "has space"})).is_err());
        assert!(validator
            .check(&json!({"event": "x".repeat(MAX_EVENT_NAME_LENGTH + 1)}))
            .is_err());
    }

    #[test]
    fn test_user_validator_runs_after_defaults() {
        let validator = FrameValidator::new();
        validator.push(Box::new(|value| {
            if value.get("data").is_some() {
                Err("data not allowed".to_string())
            } else {
                Ok(())
            }
        }));

        assert!(validator.check(&json!({"event": "ping"})).is_ok());
        assert_eq!(
            validator.check(&json!({"event": "ping", "data": {}})),
            Err("data not allowed".to_string())
        );
    }
}
