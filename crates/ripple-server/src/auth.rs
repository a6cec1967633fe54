//! Upgrade-time authentication.
//!
//! When enabled, the HTTP upgrade request must carry an HMAC-signed
//! token of the form `user_id.signature`, either as a Bearer token or
//! in a cookie. Token issuance is someone else's job; the hub only
//! consumes the opaque user identity.

use crate::config::AuthConfig;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Sign a user id into a token. Exposed for tests and tooling.
#[must_use]
pub fn sign_token(user_id: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(user_id.as_bytes());
    format!("{user_id}.{}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a token and return the user id it names.
#[must_use]
pub fn verify_token(token: &str, secret: &str) -> Option<String> {
    let (user_id, signature) = token.rsplit_once('.')?;
    if user_id.is_empty() {
        return None;
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(user_id.as_bytes());
    let expected = mac.finalize().into_bytes();
    let provided = hex::decode(signature).ok()?;

    if provided.len() == expected.len() && provided.as_slice() == expected.as_slice() {
        Some(user_id.to_string())
    } else {
        None
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn cookie_token<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Option<&'a str> {
    let cookies = headers
        .get(axum::http::header::COOKIE)?
        .to_str()
        .ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == cookie_name).then_some(value)
    })
}

/// Evaluate the authenticator against an upgrade request.
///
/// Returns the attached user identity, or `Err(())` when auth is
/// enabled and no valid token is present.
pub fn authenticate(headers: &HeaderMap, config: &AuthConfig) -> Result<Option<String>, ()> {
    if !config.enabled {
        return Ok(None);
    }
    let Some(secret) = config.secret.as_deref() else {
        // Enabled without a secret can never admit anyone.
        return Err(());
    };

    let token = bearer_token(headers).or_else(|| cookie_token(headers, &config.cookie_name));
    match token.and_then(|t| verify_token(t, secret)) {
        Some(user_id) => Ok(Some(user_id)),
        None => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::{AUTHORIZATION, COOKIE};

    fn config(enabled: bool) -> AuthConfig {
        AuthConfig {
            enabled,
            secret: Some("s3cret".to_string()),
            cookie_name: "ripple_token".to_string(),
        }
    }

    #[test]
    fn test_token_round_trip() {
        let token = sign_token("user-42", "s3cret");
        assert_eq!(verify_token(&token, "s3cret").as_deref(), Some("user-42"));
        assert!(verify_token(&token, "other").is_none());
        assert!(verify_token("user-42.deadbeef", "s3cret").is_none());
        assert!(verify_token("garbage", "s3cret").is_none());
    }

    #[test]
    fn test_bearer_header() {
        let mut headers = HeaderMap::new();
        let token = sign_token("u1", "s3cret");
        headers.insert(
            AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );

        assert_eq!(
            authenticate(&headers, &config(true)).unwrap().as_deref(),
            Some("u1")
        );
    }

    #[test]
    fn test_cookie_fallback() {
        let mut headers = HeaderMap::new();
        let token = sign_token("u2", "s3cret");
        headers.insert(
            COOKIE,
            format!("theme=dark; ripple_token={token}").parse().unwrap(),
        );

        assert_eq!(
            authenticate(&headers, &config(true)).unwrap().as_deref(),
            Some("u2")
        );
    }

    #[test]
    fn test_missing_token_rejected_when_enabled() {
        let headers = HeaderMap::new();
        assert!(authenticate(&headers, &config(true)).is_err());
        assert_eq!(authenticate(&headers, &config(false)), Ok(None));
    }
}
