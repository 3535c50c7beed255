//! Engine configuration.
//!
//! [`EngineConfig`] is loaded once at startup (usually from TOML), validated
//! with [`EngineConfig::validate`], and then handed to
//! [`AuthFlow::new`](crate::AuthFlow::new). Every tunable the engine uses has
//! a named field with a documented default; there are no free-form option
//! bags.
//!
//! ```toml
//! [provider]
//! issuer = "https://appleid.apple.com"
//! client_id = "com.example.app"
//! authorization_endpoint = "https://appleid.apple.com/auth/authorize"
//! redirect_uri = "https://example.com/auth/callback"
//!
//! [session]
//! signing_key = "base64url-encoded-32-byte-secret..."
//! ```

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AuthEngineError, Result};

/// Minimum random bytes in a PKCE verifier or refresh token.
pub const MIN_SECRET_BYTES: usize = 32;

/// Maximum verifier bytes; 96 bytes encode to the RFC 7636 limit of 128 chars.
pub const MAX_VERIFIER_BYTES: usize = 96;

/// Minimum decoded length of the access-token signing key.
pub const MIN_SIGNING_KEY_BYTES: usize = 32;

/// Upper bound on every configured lifetime or duration (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 86_400;

const REDACTED: &str = "<redacted>";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Identity provider registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Expected `iss` claim. Required.
    pub issuer: String,
    /// Client identifier registered with the provider; the expected `aud`.
    /// Required.
    pub client_id: String,
    /// The provider's authorization endpoint. Required.
    pub authorization_endpoint: String,
    /// Redirect URI registered with the provider. Required.
    pub redirect_uri: String,
    /// Scopes to request. Default: `["openid", "email"]`.
    pub scopes: Vec<String>,
    /// Optional `response_mode` (e.g. `form_post`). Default: unset.
    pub response_mode: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            client_id: String::new(),
            authorization_endpoint: String::new(),
            redirect_uri: String::new(),
            scopes: vec!["openid".to_string(), "email".to_string()],
            response_mode: None,
        }
    }
}

/// PKCE challenge store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkceConfig {
    /// Lifetime of a pending sign-in request. Default: 600 seconds.
    pub ttl_secs: u64,
    /// Random bytes in each verifier (32..=96). Default: 32.
    pub verifier_bytes: usize,
}

impl Default for PkceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            verifier_bytes: MIN_SECRET_BYTES,
        }
    }
}

/// Identity-token claim validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimsConfig {
    /// Tolerated clock difference with the provider. Default: 30 seconds.
    pub clock_skew_secs: u64,
    /// Maximum age of `iat`. Default: 600 seconds.
    pub max_token_age_secs: u64,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            clock_skew_secs: 30,
            max_token_age_secs: 600,
        }
    }
}

/// Progressive lockout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Consecutive failures that trigger a lockout. Default: 5.
    pub threshold: u32,
    /// Duration of the first lockout. Default: 900 seconds.
    pub base_duration_secs: u64,
    /// Growth factor per subsequent lockout. Default: 2.
    pub multiplier: u32,
    /// Upper bound on any lockout. Default: 86400 seconds.
    pub max_duration_secs: u64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            base_duration_secs: 15 * 60,
            multiplier: 2,
            max_duration_secs: 24 * 60 * 60,
        }
    }
}

/// What to do when an account is at its concurrent-session limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLimitPolicy {
    /// Evict the oldest active session to make room.
    #[default]
    EvictOldest,
    /// Refuse the new session with `MaxSessionsReached`.
    Reject,
}

/// Session and token issuance settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of access tokens. Default: 900 seconds.
    pub access_token_ttl_secs: u64,
    /// Lifetime of a session (and its refresh token). Default: 30 days.
    pub refresh_token_ttl_secs: u64,
    /// Active sessions allowed per account. Default: 5.
    pub max_concurrent_sessions: u32,
    /// Behaviour at the limit. Default: `evict_oldest`.
    pub limit_policy: SessionLimitPolicy,
    /// Random bytes in each refresh token (min 32). Default: 32.
    pub refresh_token_bytes: usize,
    /// Base64url HMAC key for access tokens (min 32 decoded bytes). Required.
    pub signing_key: String,
    /// `iss` stamped into access tokens. Default: `"signet"`.
    pub token_issuer: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            access_token_ttl_secs: 15 * 60,
            refresh_token_ttl_secs: 30 * 24 * 60 * 60,
            max_concurrent_sessions: 5,
            limit_policy: SessionLimitPolicy::EvictOldest,
            refresh_token_bytes: MIN_SECRET_BYTES,
            signing_key: String::new(),
            token_issuer: "signet".to_string(),
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("access_token_ttl_secs", &self.access_token_ttl_secs)
            .field("refresh_token_ttl_secs", &self.refresh_token_ttl_secs)
            .field("max_concurrent_sessions", &self.max_concurrent_sessions)
            .field("limit_policy", &self.limit_policy)
            .field("refresh_token_bytes", &self.refresh_token_bytes)
            .field("signing_key", &REDACTED)
            .field("token_issuer", &self.token_issuer)
            .finish()
    }
}

impl SessionConfig {
    /// Decode the signing key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthEngineError::InvalidConfig`] if the key is not valid
    /// base64url or is shorter than [`MIN_SIGNING_KEY_BYTES`].
    pub fn signing_key_bytes(&self) -> Result<Vec<u8>> {
        let bytes = URL_SAFE_NO_PAD
            .decode(self.signing_key.trim_end_matches('='))
            .map_err(|e| invalid(format!("session.signing_key is not base64url: {e}")))?;
        if bytes.len() < MIN_SIGNING_KEY_BYTES {
            return Err(invalid(format!(
                "session.signing_key must decode to at least {MIN_SIGNING_KEY_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

/// Repository and collaborator call settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Deadline for each repository or collaborator call. Default: 5000 ms.
    pub operation_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 5_000,
        }
    }
}

impl StorageConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub provider: ProviderConfig,
    pub pkce: PkceConfig,
    pub claims: ClaimsConfig,
    pub lockout: LockoutConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`AuthEngineError::InvalidConfig`] on a parse error or any
    /// failed validation rule.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| invalid(format!("failed to parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`AuthEngineError::InvalidConfig`] if the file cannot be read
    /// or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "engine configuration loaded");
        Ok(config)
    }

    /// Check every rule the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns [`AuthEngineError::InvalidConfig`] naming the first offending
    /// field.
    pub fn validate(&self) -> Result<()> {
        let p = &self.provider;
        if p.issuer.trim().is_empty() {
            return Err(invalid("provider.issuer is required"));
        }
        if p.client_id.trim().is_empty() {
            return Err(invalid("provider.client_id is required"));
        }
        Url::parse(&p.authorization_endpoint)
            .map_err(|e| invalid(format!("provider.authorization_endpoint: {e}")))?;
        Url::parse(&p.redirect_uri).map_err(|e| invalid(format!("provider.redirect_uri: {e}")))?;

        if self.pkce.ttl_secs == 0 {
            return Err(invalid("pkce.ttl_secs must be positive"));
        }
        if !(MIN_SECRET_BYTES..=MAX_VERIFIER_BYTES).contains(&self.pkce.verifier_bytes) {
            return Err(invalid(format!(
                "pkce.verifier_bytes must be between {MIN_SECRET_BYTES} and {MAX_VERIFIER_BYTES}"
            )));
        }

        if self.claims.max_token_age_secs == 0 {
            return Err(invalid("claims.max_token_age_secs must be positive"));
        }

        let l = &self.lockout;
        if l.threshold == 0 {
            return Err(invalid("lockout.threshold must be at least 1"));
        }
        if l.multiplier == 0 {
            return Err(invalid("lockout.multiplier must be at least 1"));
        }
        if l.base_duration_secs == 0 {
            return Err(invalid("lockout.base_duration_secs must be positive"));
        }
        if l.base_duration_secs > l.max_duration_secs {
            return Err(invalid(
                "lockout.base_duration_secs must not exceed lockout.max_duration_secs",
            ));
        }

        let s = &self.session;
        if s.access_token_ttl_secs == 0 || s.refresh_token_ttl_secs == 0 {
            return Err(invalid("session token lifetimes must be positive"));
        }
        if s.max_concurrent_sessions == 0 {
            return Err(invalid("session.max_concurrent_sessions must be at least 1"));
        }
        if s.refresh_token_bytes < MIN_SECRET_BYTES {
            return Err(invalid(format!(
                "session.refresh_token_bytes must be at least {MIN_SECRET_BYTES}"
            )));
        }
        if s.token_issuer.is_empty() {
            return Err(invalid("session.token_issuer must not be empty"));
        }
        s.signing_key_bytes()?;

        if self.storage.operation_timeout_ms == 0 {
            return Err(invalid("storage.operation_timeout_ms must be positive"));
        }

        for (field, secs) in [
            ("pkce.ttl_secs", self.pkce.ttl_secs),
            ("claims.clock_skew_secs", self.claims.clock_skew_secs),
            ("claims.max_token_age_secs", self.claims.max_token_age_secs),
            ("lockout.max_duration_secs", l.max_duration_secs),
            ("session.access_token_ttl_secs", s.access_token_ttl_secs),
            ("session.refresh_token_ttl_secs", s.refresh_token_ttl_secs),
            ("storage.operation_timeout_ms", self.storage.operation_timeout_ms / 1000),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(invalid(format!(
                    "{field} exceeds the maximum of {MAX_DURATION_SECS} seconds"
                )));
            }
        }

        Ok(())
    }

    /// A copy safe to print: the signing key is replaced.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.session.signing_key = REDACTED.to_string();
        copy
    }
}

fn invalid(reason: impl Into<String>) -> AuthEngineError {
    AuthEngineError::InvalidConfig {
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
