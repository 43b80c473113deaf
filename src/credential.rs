//! Bearer credential for the reference service.
//!
//! A credential always carries a concrete expiry. It is taken from the login
//! response when present, otherwise from the token's own `exp` claim, and
//! finally from the configured lifetime.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::time::Duration;

/// Treat a credential as expired this long before it actually is.
const EXPIRY_SKEW_SECS: i64 = 10;

#[derive(Clone, PartialEq)]
pub struct Credential {
    token: String,
    expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Credential {{ token: [REDUCTED], expires_at: {} }}",
            self.expires_at
        )
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

impl Credential {
    /// Build a credential from a login response.
    ///
    /// `expires_in` is the lifetime in seconds reported by the service, if any.
    pub fn issue(token: impl Into<String>, expires_in: Option<u64>, fallback_ttl: Duration, now: DateTime<Utc>) -> Self {
        let token = token.into();

        // lifetimes that do not fit a timestamp fall through to the next source
        let expires_at = expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(ChronoDuration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .or_else(|| jwt_expiry(&token))
            .or_else(|| {
                ChronoDuration::from_std(fallback_ttl)
                    .ok()
                    .and_then(|ttl| now.checked_add_signed(ttl))
            })
            .unwrap_or(now);

        Self { token, expires_at }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.checked_add_signed(ChronoDuration::seconds(EXPIRY_SKEW_SECS))
            .map_or(true, |deadline| deadline >= self.expires_at)
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Read the `exp` claim of a JWT without verifying it.
fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);

    let payload = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&payload).ok()?;

    DateTime::from_timestamp(claims.exp?, 0)
}
