//! Error types for the auth engine crate.
//!
//! Every engine operation surfaces failures through [`AuthEngineError`].
//! Callers (typically an HTTP layer) match on the variant to pick a status
//! code; nothing is swallowed on the way out.

use std::fmt;

use crate::repository::RepositoryError;

/// The specific identity-token claim that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimViolation {
    /// `iss` does not match the configured provider issuer.
    Issuer,
    /// `aud` does not contain the configured client identifier.
    Audience,
    /// `sub` is missing or empty.
    Subject,
    /// `exp` is in the past (beyond the clock-skew tolerance).
    Expired,
    /// `iat` is in the future (beyond the clock-skew tolerance).
    IssuedInFuture,
    /// `iat` is older than the freshness window.
    Stale,
    /// The token carries no `nonce`.
    NonceMissing,
    /// The `nonce` does not match the one issued for this flow.
    NonceMismatch,
}

impl ClaimViolation {
    /// The claim name this violation refers to.
    pub fn claim(&self) -> &'static str {
        match self {
            Self::Issuer => "iss",
            Self::Audience => "aud",
            Self::Subject => "sub",
            Self::Expired => "exp",
            Self::IssuedInFuture | Self::Stale => "iat",
            Self::NonceMissing | Self::NonceMismatch => "nonce",
        }
    }
}

impl fmt::Display for ClaimViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let detail = match self {
            Self::Issuer => "unexpected issuer",
            Self::Audience => "audience does not include client",
            Self::Subject => "missing subject",
            Self::Expired => "token expired",
            Self::IssuedInFuture => "issued in the future",
            Self::Stale => "token too old",
            Self::NonceMissing => "nonce missing",
            Self::NonceMismatch => "nonce mismatch",
        };
        write!(f, "{}: {detail}", self.claim())
    }
}

/// Unified error type for the signet auth engine.
#[derive(Debug, thiserror::Error)]
pub enum AuthEngineError {
    /// The `state` value is unknown, expired, or was already consumed.
    #[error("invalid or expired sign-in state")]
    InvalidState,

    /// The PKCE verifier is malformed or does not match the pending request.
    #[error("invalid PKCE verifier")]
    InvalidPkce,

    /// The identity provider rejected the code exchange or the identity
    /// token failed signature verification.
    #[error("identity provider authentication failed: {reason}")]
    ProviderAuthFailed {
        /// What the provider (or its verifier) reported.
        reason: String,
    },

    /// A claim in the verified identity token is unacceptable.
    #[error("claim validation failed ({reason})")]
    ClaimValidationFailed {
        /// The violated claim.
        reason: ClaimViolation,
    },

    /// The account is temporarily locked after repeated failures.
    #[error("account locked, retry after {retry_after_secs} seconds")]
    AccountLocked {
        /// Seconds until the lock lifts.
        retry_after_secs: u64,
    },

    /// The presented token is unknown, expired, malformed, or badly signed.
    #[error("invalid or expired token")]
    InvalidToken,

    /// A refresh token was presented after it had already been rotated.
    /// Every session of the account has been revoked.
    #[error("refresh token reuse detected, all sessions revoked")]
    TokenTheftDetected,

    /// The client fingerprint differs from the one bound to the session.
    #[error("client fingerprint does not match session")]
    DeviceMismatch,

    /// The account is at its concurrent-session limit and the limit policy
    /// rejects new sessions.
    #[error("maximum concurrent sessions reached ({limit})")]
    MaxSessionsReached {
        /// The configured limit.
        limit: u32,
    },

    /// Storage or a collaborator timed out or failed. Safe to retry.
    #[error("service unavailable: {reason}")]
    Unavailable {
        /// What was unavailable.
        reason: String,
    },

    /// Configuration is missing or malformed.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },
}

impl AuthEngineError {
    /// Whether the caller must restart authentication from scratch.
    pub fn forces_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::AccountLocked { .. } | Self::TokenTheftDetected
        )
    }

    /// Whether the same request may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

impl From<RepositoryError> for AuthEngineError {
    fn from(err: RepositoryError) -> Self {
        Self::Unavailable {
            reason: err.to_string(),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthEngineError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
