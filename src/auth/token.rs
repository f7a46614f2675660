use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The current access/refresh token pair.
///
/// Replaced wholesale on login and refresh, never field-by-field, so readers
/// can never observe a half-updated pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenPair {
    /// A token is expired the instant `expires_at` passes; there is no grace
    /// buffer here. The post-login grace window lives in the session manager.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Whether the access token passes the format check. Pairs failing this
    /// are never stored, and stored pairs failing it are purged on load.
    pub fn is_well_formed(&self) -> bool {
        is_well_formed_token(&self.access_token)
    }

    pub fn seconds_until_expiry(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds()
    }
}

/// Validate that a string looks like a signed token: non-empty, not a
/// serialized placeholder, and exactly three non-empty dot-separated segments
/// (header.payload.signature form).
pub fn is_well_formed_token(token: &str) -> bool {
    if is_placeholder(token) {
        return false;
    }
    let mut segments = token.split('.');
    matches!(
        (segments.next(), segments.next(), segments.next(), segments.next()),
        (Some(header), Some(payload), Some(signature), None)
            if !header.is_empty() && !payload.is_empty() && !signature.is_empty()
    )
}

/// Empty strings and the literal placeholders a buggy caller can produce by
/// stringifying a missing value.
pub fn is_placeholder(value: &str) -> bool {
    value.is_empty() || value == "null" || value == "undefined"
}
