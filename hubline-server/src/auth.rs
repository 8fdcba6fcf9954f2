//! Bearer credential decoding.
//!
//! Tokens are issued elsewhere and trusted here: the hub reads the JWT
//! payload segment to learn who is connecting but does not verify the
//! signature or expiry. Anything that fails to decode makes the connection a
//! visitor; classification never errors.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hubline_sdk::protocol::Identity;
use serde::Deserialize;

use crate::registry::ConnectionMetadata;

const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, alias = "unique_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl Claims {
    pub fn identity(&self) -> Identity {
        Identity::new(self.sub.clone())
    }

    pub fn is_admin(&self) -> bool {
        self.role
            .as_deref()
            .is_some_and(|r| r.eq_ignore_ascii_case(ADMIN_ROLE))
    }

    pub fn metadata(&self) -> ConnectionMetadata {
        ConnectionMetadata {
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

/// Decode the claims of a JWT-shaped token. `None` for anything malformed or
/// for a blank subject.
pub fn decode_bearer(token: &str) -> Option<Claims> {
    let mut segments = token.trim().split('.');
    let (_header, payload) = (segments.next()?, segments.next()?);
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    if claims.sub.trim().is_empty() {
        return None;
    }
    Some(claims)
}

/// Resolve the caller from the `access_token` query parameter, falling back
/// to an `Authorization: Bearer` header.
pub fn resolve(query_token: Option<&str>, authorization: Option<&str>) -> Option<Claims> {
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return decode_bearer(token);
    }
    let header = authorization?;
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))?;
    decode_bearer(token)
}

#[cfg(test)]
pub(crate) fn test_token(sub: &str, name: Option<&str>, role: Option<&str>) -> String {
    let payload = serde_json::json!({ "sub": sub, "name": name, "role": role });
    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#),
        URL_SAFE_NO_PAD.encode(payload.to_string())
    )
}
