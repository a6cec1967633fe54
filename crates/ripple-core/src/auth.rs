//! Subscription authorization.
//!
//! Rules pair a channel pattern with an async handler. Rules are
//! matched in registration order and the first matching pattern wins.
//! Public channels never consult the rule table.

use crate::channel::ChannelType;
use crate::pattern::{ChannelPattern, PatternError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// What a handler decided about a subscription attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthDecision {
    /// Refuse the subscription.
    Deny,
    /// Admit the subscription.
    Allow,
    /// Admit and use this value as the presence member.
    AllowPresence(Value),
}

/// Context handed to an authorization handler.
#[derive(Debug)]
pub struct AuthContext<'a> {
    /// Socket attempting the subscription.
    pub socket_id: &'a str,
    /// User identity attached at upgrade, if any.
    pub user_id: Option<&'a str>,
    /// Full channel name.
    pub channel: &'a str,
    /// Parameters extracted from the matching pattern.
    pub params: &'a HashMap<String, String>,
    /// `channel_data` supplied with the subscribe frame.
    pub channel_data: Option<&'a Value>,
    /// `auth` token supplied with the subscribe frame.
    pub auth: Option<&'a str>,
}

/// Handler failure type; surfaces to the client as a server error.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// An async authorization handler.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    /// Decide whether the subscription in `ctx` is admitted.
    async fn authorize(&self, ctx: AuthContext<'_>) -> Result<AuthDecision, HandlerError>;
}

/// Adapter for plain synchronous decision functions.
struct FnHandler<F>(F);

#[async_trait]
impl<F> AuthHandler for FnHandler<F>
where
    F: Fn(AuthContext<'_>) -> Result<AuthDecision, HandlerError> + Send + Sync,
{
    async fn authorize(&self, ctx: AuthContext<'_>) -> Result<AuthDecision, HandlerError> {
        (self.0)(ctx)
    }
}

/// Authorization failure, with the HTTP-ish status surfaced in
/// `subscription_error`.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The matching rule denied the subscription.
    #[error("Authorization denied for channel {0}")]
    Denied(String),

    /// No rule matches a non-public channel.
    #[error("No authorization rule matches channel {0}")]
    NoRule(String),

    /// The handler itself failed.
    #[error("Authorization handler failed: {0}")]
    Handler(String),
}

impl AuthError {
    /// Status code reported to the client.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            AuthError::Denied(_) | AuthError::NoRule(_) => 401,
            AuthError::Handler(_) => 500,
        }
    }
}

struct AuthRule {
    pattern: ChannelPattern,
    handler: Arc<dyn AuthHandler>,
}

/// Ordered authorization rule table.
#[derive(Default)]
pub struct Authorizer {
    rules: RwLock<Vec<AuthRule>>,
}

/// A granted subscription: the presence member value to record, when
/// the handler supplied one.
pub type Granted = Option<Value>;

impl Authorizer {
    /// Create an empty authorizer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a channel pattern.
    ///
    /// Re-registering an existing pattern replaces its handler in
    /// place; first-match order stays insertion order.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] when the pattern does not compile.
    pub fn register(
        &self,
        pattern: &str,
        handler: Arc<dyn AuthHandler>,
    ) -> Result<(), PatternError> {
        let compiled = ChannelPattern::compile(pattern)?;
        let mut rules = self.rules.write().expect("auth rules lock poisoned");
        if let Some(existing) = rules.iter_mut().find(|r| r.pattern.as_str() == pattern) {
            existing.handler = handler;
        } else {
            rules.push(AuthRule {
                pattern: compiled,
                handler,
            });
        }
        Ok(())
    }

    /// Register a synchronous decision function for a pattern.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] when the pattern does not compile.
    pub fn register_fn<F>(&self, pattern: &str, f: F) -> Result<(), PatternError>
    where
        F: Fn(AuthContext<'_>) -> Result<AuthDecision, HandlerError> + Send + Sync + 'static,
    {
        self.register(pattern, Arc::new(FnHandler(f)))
    }

    /// Number of registered rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.read().expect("auth rules lock poisoned").len()
    }

    /// Authorize a subscription attempt.
    ///
    /// Public channels are always granted without consulting rules.
    /// For the rest, the first rule whose pattern matches decides.
    ///
    /// # Errors
    ///
    /// [`AuthError::Denied`] when the handler refuses,
    /// [`AuthError::NoRule`] when nothing matches a non-public
    /// channel, [`AuthError::Handler`] when the handler fails.
    pub async fn authorize(
        &self,
        socket_id: &str,
        user_id: Option<&str>,
        channel: &str,
        channel_data: Option<&Value>,
        auth: Option<&str>,
    ) -> Result<Granted, AuthError> {
        if !ChannelType::of(channel).requires_auth() {
            return Ok(None);
        }

        let matched = {
            let rules = self.rules.read().expect("auth rules lock poisoned");
            rules.iter().find_map(|rule| {
                rule.pattern
                    .extract(channel)
                    .map(|params| (params, Arc::clone(&rule.handler)))
            })
        };

        let Some((params, handler)) = matched else {
            return Err(AuthError::NoRule(channel.to_string()));
        };

        let ctx = AuthContext {
            socket_id,
            user_id,
            channel,
            params: &params,
            channel_data,
            auth,
        };

        match handler.authorize(ctx).await {
            Ok(AuthDecision::Allow) => Ok(None),
            Ok(AuthDecision::AllowPresence(member)) => Ok(Some(member)),
            Ok(AuthDecision::Deny) => Err(AuthError::Denied(channel.to_string())),
            Err(e) => Err(AuthError::Handler(e.to_string())),
        }
    }
}
