//! Proof Key for Code Exchange (RFC 7636) challenge store.
//!
//! [`PkceStore::begin`] mints a verifier, derives its S256 challenge, and
//! parks the verifier (plus the flow's nonce) under a fresh state token.
//! [`PkceStore::complete`] redeems a state token exactly once and hands the
//! verifier back for the token exchange.
//!
//! Pending entries are keyed by the SHA-256 of the state token, so the raw
//! value a client sends is never compared against storage byte by byte.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::PkceConfig;
use crate::crypto::{constant_time_eq, random_token, sha256_b64};
use crate::deadline::bounded;
use crate::error::{AuthEngineError, Result};
use crate::model::{PendingAuthRequest, after_secs};
use crate::repository::PendingAuthRepository;

/// Random bytes in state tokens and nonces.
const STATE_BYTES: usize = 32;

/// RFC 7636 §4.1 verifier length bounds (characters).
const VERIFIER_MIN_LEN: usize = 43;
const VERIFIER_MAX_LEN: usize = 128;

// ---------------------------------------------------------------------------
// PKCE helpers
// ---------------------------------------------------------------------------

/// Derive the PKCE code challenge from a code verifier using SHA-256.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn pkce_challenge(verifier: &str) -> String {
    sha256_b64(verifier)
}

/// Whether `verifier` is syntactically valid per RFC 7636 §4.1.
pub fn is_valid_verifier(verifier: &str) -> bool {
    (VERIFIER_MIN_LEN..=VERIFIER_MAX_LEN).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What [`PkceStore::begin`] hands back for the authorization request.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// Opaque state token to send as `state`.
    pub state: String,
    /// S256 challenge to send as `code_challenge`.
    pub code_challenge: String,
    /// Nonce to send as `nonce`; the identity token must echo it.
    pub nonce: String,
}

/// What [`PkceStore::complete`] hands back for the token exchange.
#[derive(Clone)]
pub struct PkceGrant {
    /// The `code_verifier` for the token endpoint.
    pub code_verifier: String,
    /// The nonce issued for this flow.
    pub nonce: String,
}

impl std::fmt::Debug for PkceGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceGrant").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Issues and redeems PKCE challenges backed by a [`PendingAuthRepository`].
pub struct PkceStore {
    repo: Arc<dyn PendingAuthRepository>,
    config: PkceConfig,
    timeout: Duration,
}

impl PkceStore {
    pub fn new(repo: Arc<dyn PendingAuthRepository>, config: PkceConfig, timeout: Duration) -> Self {
        Self {
            repo,
            config,
            timeout,
        }
    }

    /// Start a sign-in: generate state, verifier, challenge and nonce, and
    /// persist the verifier for `pkce.ttl_secs`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthEngineError::Unavailable`] if the CSPRNG or the
    /// repository fails.
    pub async fn begin(&self) -> Result<PkceChallenge> {
        let state = random_token(STATE_BYTES)?;
        let code_verifier = random_token(self.config.verifier_bytes)?;
        let nonce = random_token(STATE_BYTES)?;
        let code_challenge = pkce_challenge(&code_verifier);

        let now = Utc::now();
        let request = PendingAuthRequest {
            state_hash: sha256_b64(&state),
            code_verifier,
            nonce: nonce.clone(),
            created_at: now,
            expires_at: after_secs(now, self.config.ttl_secs)?,
        };

        bounded(self.timeout, "pending_auth.put", self.repo.put(&request)).await?;
        tracing::debug!(expires_at = %request.expires_at, "pending sign-in stored");

        Ok(PkceChallenge {
            state,
            code_challenge,
            nonce,
        })
    }

    /// Redeem a state token.
    ///
    /// The pending entry is consumed whatever the outcome, so a state token
    /// can never be replayed. If the caller also holds the verifier (native
    /// clients that generated their own challenge), pass it as `supplied` and
    /// it is checked against the stored one in constant time.
    ///
    /// # Errors
    ///
    /// - [`AuthEngineError::InvalidState`] if the state is unknown, expired
    ///   or already redeemed.
    /// - [`AuthEngineError::InvalidPkce`] if `supplied` is malformed or does
    ///   not match.
    /// - [`AuthEngineError::Unavailable`] on repository failure.
    pub async fn complete(&self, state: &str, supplied: Option<&str>) -> Result<PkceGrant> {
        let state_hash = sha256_b64(state);
        let pending = bounded(
            self.timeout,
            "pending_auth.take_once",
            self.repo.take_once(&state_hash, Utc::now()),
        )
        .await?
        .ok_or(AuthEngineError::InvalidState)?;

        if !constant_time_eq(pending.state_hash.as_bytes(), state_hash.as_bytes()) {
            return Err(AuthEngineError::InvalidState);
        }

        if let Some(supplied) = supplied {
            if !is_valid_verifier(supplied)
                || !constant_time_eq(supplied.as_bytes(), pending.code_verifier.as_bytes())
            {
                tracing::warn!("supplied PKCE verifier rejected");
                return Err(AuthEngineError::InvalidPkce);
            }
        }

        Ok(PkceGrant {
            code_verifier: pending.code_verifier,
            nonce: pending.nonce,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPendingAuthRepository;

    fn store() -> (PkceStore, Arc<MemoryPendingAuthRepository>) {
        let repo = Arc::new(MemoryPendingAuthRepository::new());
        let store = PkceStore::new(repo.clone(), PkceConfig::default(), Duration::from_secs(1));
        (store, repo)
    }

    #[test]
    fn pkce_challenge_is_base64url_sha256() {
        // RFC 7636 Appendix B test vector.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            pkce_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifier_syntax() {
        assert!(is_valid_verifier(
            "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"
        ));
        assert!(!is_valid_verifier("too-short"));
        assert!(!is_valid_verifier(&"a".repeat(129)));
        assert!(!is_valid_verifier(&format!("{}+", "a".repeat(43))));
        assert!(is_valid_verifier(&format!("{}~.", "a".repeat(43))));
    }

    #[tokio::test]
    async fn begin_with_out_of_range_ttl_fails_cleanly() {
        let repo = Arc::new(MemoryPendingAuthRepository::new());
        let config = PkceConfig {
            ttl_secs: 10_u64.pow(16),
            ..PkceConfig::default()
        };
        let store = PkceStore::new(repo.clone(), config, Duration::from_secs(1));

        assert!(matches!(
            store.begin().await,
            Err(AuthEngineError::InvalidConfig { .. })
        ));
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn begin_returns_matching_challenge() {
        let (store, _) = store();
        let challenge = store.begin().await.unwrap();
        let grant = store.complete(&challenge.state, None).await.unwrap();

        assert_eq!(pkce_challenge(&grant.code_verifier), challenge.code_challenge);
        assert_eq!(grant.nonce, challenge.nonce);
        // 32 bytes base64url encoded = 43 characters.
        assert_eq!(grant.code_verifier.len(), 43);
        assert!(is_valid_verifier(&grant.code_verifier));
    }

    #[tokio::test]
    async fn state_is_single_use() {
        let (store, _) = store();
        let challenge = store.begin().await.unwrap();

        assert!(store.complete(&challenge.state, None).await.is_ok());
        assert!(matches!(
            store.complete(&challenge.state, None).await,
            Err(AuthEngineError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn unknown_state_rejected() {
        let (store, _) = store();
        assert!(matches!(
            store.complete("never-issued", None).await,
            Err(AuthEngineError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn expired_state_rejected() {
        let repo = Arc::new(MemoryPendingAuthRepository::new());
        let store = PkceStore::new(
            repo.clone(),
            PkceConfig {
                ttl_secs: 1,
                ..PkceConfig::default()
            },
            Duration::from_secs(1),
        );
        let challenge = store.begin().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert!(matches!(
            store.complete(&challenge.state, None).await,
            Err(AuthEngineError::InvalidState)
        ));
        assert_eq!(repo.len(), 0);
    }

    #[tokio::test]
    async fn supplied_verifier_must_match() {
        let (store, repo) = store();
        let challenge = store.begin().await.unwrap();
        let wrong = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

        assert!(matches!(
            store.complete(&challenge.state, Some(wrong)).await,
            Err(AuthEngineError::InvalidPkce)
        ));
        // Consumed even though the verifier was wrong.
        assert_eq!(repo.len(), 0);
    }

    #[tokio::test]
    async fn supplied_verifier_accepted_when_equal() {
        let (store, repo) = store();
        let challenge = store.begin().await.unwrap();
        let verifier = repo.verifier_for_state(&challenge.state).unwrap();

        let grant = store
            .complete(&challenge.state, Some(&verifier))
            .await
            .unwrap();
        assert_eq!(grant.code_verifier, verifier);
    }

    #[tokio::test]
    async fn raw_state_is_not_stored() {
        let (store, repo) = store();
        let challenge = store.begin().await.unwrap();
        assert!(!repo.contains_key(&challenge.state));
        assert!(repo.contains_key(&sha256_b64(&challenge.state)));
    }
}
