//! Persistent records owned by the engine.
//!
//! These are the rows the repository traits in [`crate::repository`] read
//! and write. Identifiers are UUID v7 strings so that lexical order follows
//! creation order.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AuthEngineError, Result};

/// `now + secs`, failing instead of overflowing.
pub(crate) fn after_secs(now: DateTime<Utc>, secs: u64) -> Result<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| AuthEngineError::InvalidConfig {
            reason: format!("lifetime of {secs} seconds is out of range"),
        })
}

/// A sign-in attempt waiting for the provider callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAuthRequest {
    /// Base64url SHA-256 of the opaque state token. Lookups go through the
    /// digest so the raw token is never stored or compared byte-by-byte.
    pub state_hash: String,
    /// PKCE code verifier handed to the token exchange.
    pub code_verifier: String,
    /// Nonce expected in the identity token.
    pub nonce: String,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// When the request stops being redeemable.
    pub expires_at: DateTime<Utc>,
}

impl PendingAuthRequest {
    /// Whether the request can no longer be completed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A local account linked to one identity-provider subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique identifier (UUID v7).
    pub id: String,
    /// The provider's stable user identifier (`sub`).
    pub external_subject: String,
    /// Last email address reported by the provider, if any.
    pub email: Option<String>,
    /// Whether the provider has verified the email.
    pub email_verified: bool,
    /// When the account was first created.
    pub created_at: DateTime<Utc>,
    /// When the account last signed in successfully.
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Failed-attempt bookkeeping for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutState {
    pub account_id: String,
    /// Consecutive failures since the last lockout or success.
    pub failed_attempts: u32,
    /// Lockouts applied since the last success.
    pub lockout_count: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
}

impl LockoutState {
    /// A fresh, unlocked state for `account_id`.
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            failed_attempts: 0,
            lockout_count: 0,
            locked_until: None,
            last_failed_at: None,
        }
    }
}

/// A refresh-token-backed session.
///
/// Only the SHA-256 hash of the refresh token is ever stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier (UUID v7).
    pub id: String,
    pub account_id: String,
    /// Base64url SHA-256 of the refresh token.
    pub refresh_token_hash: String,
    /// Normalized client fingerprint the session is bound to.
    pub client_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Set once the refresh token has been exchanged. A rotated row never
    /// validates again; presenting its token signals theft.
    pub rotated_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Whether the session has passed its natural expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the session counts toward the concurrency limit at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.rotated_at.is_none() && !self.is_expired(now)
    }
}

/// A normalized client signal a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Placeholder used when the client supplies nothing.
    pub const UNKNOWN: &'static str = "unknown";

    /// Normalize a raw client identifier (typically a user agent).
    ///
    /// Trims, collapses runs of whitespace into one space and lowercases.
    pub fn normalize(raw: &str) -> Self {
        let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            return Self(Self::UNKNOWN.to_string());
        }
        Self(collapsed.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
