//! Access and refresh credential minting.
//!
//! Access tokens are stateless JWTs signed with HMAC-SHA256
//! (`alg = HS256`, via `jsonwebtoken`). They carry the account id, the session id and an
//! expiry, and are checked without touching storage.
//!
//! Refresh tokens are opaque random strings. Only their SHA-256 digest is
//! persisted.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::crypto::{random_token, sha256_b64};
use crate::error::{AuthEngineError, Result};
use crate::model::after_secs;

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Issuer (`session.token_issuer`).
    pub iss: String,
    /// Account id.
    pub sub: String,
    /// Session id.
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and verifies access tokens with one HMAC key.
pub struct AccessTokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
}

impl AccessTokenSigner {
    pub fn new(secret: &[u8], issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            issuer,
        }
    }

    /// Produce a signed token for `claims`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthEngineError::Unavailable`] if encoding fails.
    pub fn sign(&self, claims: &AccessClaims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthEngineError::unavailable(format!("token encoding failed: {e}")))
    }

    /// Mint claims for a session and sign them.
    pub fn issue(
        &self,
        account_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
        ttl_secs: u64,
    ) -> Result<String> {
        self.sign(&AccessClaims {
            iss: self.issuer.clone(),
            sub: account_id.to_string(),
            sid: session_id.to_string(),
            iat: now.timestamp(),
            exp: after_secs(now, ttl_secs)?.timestamp(),
        })
    }

    /// Verify signature, algorithm, issuer and expiry.
    ///
    /// A token whose `exp` equals `now` is already expired.
    ///
    /// # Errors
    ///
    /// Returns [`AuthEngineError::InvalidToken`] on any defect.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims> {
        let data = decode::<AccessClaims>(token, &self.decoding, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "access token rejected");
            AuthEngineError::InvalidToken
        })?;
        if data.claims.exp <= now.timestamp() {
            return Err(AuthEngineError::InvalidToken);
        }
        Ok(data.claims)
    }
}

/// A freshly generated refresh token and the digest to store.
pub struct RefreshToken {
    pub token: String,
    pub hash: String,
}

impl RefreshToken {
    /// Generate `bytes` random bytes of refresh token.
    pub fn generate(bytes: usize) -> Result<Self> {
        let token = random_token(bytes)?;
        let hash = hash_refresh_token(&token);
        Ok(Self { token, hash })
    }
}

/// One-way digest under which a refresh token is stored and looked up.
pub fn hash_refresh_token(token: &str) -> String {
    sha256_b64(token)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    use super::*;

    fn signer() -> AccessTokenSigner {
        AccessTokenSigner::new(b"0123456789abcdef0123456789abcdef", "signet")
    }

    #[test]
    fn issue_and_verify() {
        let now = Utc::now();
        let token = signer()
            .issue("acct-1", "sess-1", now, 900)
            .unwrap();
        assert_eq!(token.split('.').count(), 3);

        let claims = signer().verify(&token, now).unwrap();
        assert_eq!(claims.sub, "acct-1");
        assert_eq!(claims.sid, "sess-1");
        assert_eq!(claims.iss, "signet");
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn expired_token_rejected() {
        let now = Utc::now();
        let token = signer()
            .issue("a", "s", now, 10)
            .unwrap();
        assert!(matches!(
            signer().verify(&token, now + chrono::Duration::seconds(10)),
            Err(AuthEngineError::InvalidToken)
        ));
    }

    #[test]
    fn wrong_key_rejected() {
        let now = Utc::now();
        let token = signer()
            .issue("a", "s", now, 300)
            .unwrap();
        let other = AccessTokenSigner::new(b"ffffffffffffffffffffffffffffffff", "signet");
        assert!(other.verify(&token, now).is_err());
    }

    #[test]
    fn wrong_issuer_rejected() {
        let now = Utc::now();
        let token = signer()
            .issue("a", "s", now, 300)
            .unwrap();
        let other = AccessTokenSigner::new(b"0123456789abcdef0123456789abcdef", "elsewhere");
        assert!(other.verify(&token, now).is_err());
    }

    #[test]
    fn tampered_payload_rejected() {
        let now = Utc::now();
        let token = signer()
            .issue("a", "s", now, 300)
            .unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged_claims = AccessClaims {
            iss: "signet".to_string(),
            sub: "admin".to_string(),
            sid: "s".to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + 300,
        };
        let forged = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        let tampered = format!("{}.{}.{}", parts[0], forged, parts[2]);
        assert!(signer().verify(&tampered, now).is_err());
    }

    #[test]
    fn malformed_tokens_rejected() {
        let now = Utc::now();
        for bad in ["", "a.b", "a.b.c.d", "!!.??.**"] {
            assert!(
                matches!(signer().verify(bad, now), Err(AuthEngineError::InvalidToken)),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn refresh_token_hash_matches_digest() {
        let refresh = RefreshToken::generate(32).unwrap();
        assert_eq!(refresh.token.len(), 43);
        assert_eq!(refresh.hash, hash_refresh_token(&refresh.token));
        assert_ne!(refresh.hash, refresh.token);
    }
}
