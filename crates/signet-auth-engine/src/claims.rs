//! Identity-token claim validation.
//!
//! The token-exchange collaborator verifies the identity token's signature
//! and hands over its claims as [`VerifiedClaims`]. [`ClaimsValidator`]
//! then decides whether those claims are acceptable for *this* flow:
//! issuer, audience, subject, timestamps and nonce. On success it produces
//! a normalized [`Identity`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::{ClaimsConfig, ProviderConfig};
use crate::crypto::constant_time_eq;
use crate::error::{AuthEngineError, ClaimViolation, Result};

/// Signature-verified identity-token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedClaims {
    pub iss: String,
    /// Audience; providers send either a string or an array.
    #[serde(deserialize_with = "deserialize_audience")]
    pub aud: Vec<String>,
    #[serde(default)]
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Some providers send `"true"`/`"false"` strings here.
    #[serde(default, deserialize_with = "deserialize_loose_bool")]
    pub email_verified: Option<bool>,
}

/// Normalized identity extracted from accepted claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub external_subject: String,
    pub email: Option<String>,
    pub email_verified: bool,
}

/// Validates [`VerifiedClaims`] against the provider registration.
#[derive(Debug, Clone)]
pub struct ClaimsValidator {
    issuer: String,
    client_id: String,
    clock_skew: i64,
    max_age: i64,
}

impl ClaimsValidator {
    pub fn new(provider: &ProviderConfig, config: &ClaimsConfig) -> Self {
        Self {
            issuer: provider.issuer.clone(),
            client_id: provider.client_id.clone(),
            clock_skew: i64::try_from(config.clock_skew_secs).unwrap_or(i64::MAX),
            max_age: i64::try_from(config.max_token_age_secs).unwrap_or(i64::MAX),
        }
    }

    /// Whether `iss` is exactly the configured issuer.
    ///
    /// Subjects are only meaningful within their issuer's namespace, so the
    /// orchestrator uses this to decide whether a failed attempt can be
    /// attributed to a local account.
    pub fn issuer_matches(&self, claims: &VerifiedClaims) -> bool {
        claims.iss == self.issuer
    }

    /// Validate `claims` for a flow that issued `expected_nonce`, at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthEngineError::ClaimValidationFailed`] naming the first
    /// violated claim.
    pub fn validate(
        &self,
        claims: &VerifiedClaims,
        expected_nonce: &str,
        now: DateTime<Utc>,
    ) -> Result<Identity> {
        self.check(claims, expected_nonce, now.timestamp())
            .map_err(|reason| {
                tracing::warn!(claim = reason.claim(), %reason, "identity token rejected");
                AuthEngineError::ClaimValidationFailed { reason }
            })?;

        Ok(Identity {
            external_subject: claims.sub.clone(),
            email: claims
                .email
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_lowercase),
            email_verified: claims.email_verified.unwrap_or(false),
        })
    }

    fn check(
        &self,
        claims: &VerifiedClaims,
        expected_nonce: &str,
        now: i64,
    ) -> std::result::Result<(), ClaimViolation> {
        if !self.issuer_matches(claims) {
            return Err(ClaimViolation::Issuer);
        }
        if !claims.aud.iter().any(|a| a == &self.client_id) {
            return Err(ClaimViolation::Audience);
        }
        if claims.sub.trim().is_empty() {
            return Err(ClaimViolation::Subject);
        }
        if claims.exp.saturating_add(self.clock_skew) <= now {
            return Err(ClaimViolation::Expired);
        }
        if claims.iat > now.saturating_add(self.clock_skew) {
            return Err(ClaimViolation::IssuedInFuture);
        }
        if now.saturating_sub(claims.iat) > self.max_age.saturating_add(self.clock_skew) {
            return Err(ClaimViolation::Stale);
        }
        let nonce = claims.nonce.as_deref().ok_or(ClaimViolation::NonceMissing)?;
        if !constant_time_eq(nonce.as_bytes(), expected_nonce.as_bytes()) {
            return Err(ClaimViolation::NonceMismatch);
        }
        Ok(())
    }
}

/// Accept `aud` as a single string or an array of strings.
fn deserialize_audience<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Audience {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Audience::deserialize(deserializer)? {
        Audience::One(a) => vec![a],
        Audience::Many(a) => a,
    })
}

/// Accept a boolean or its string spelling.
fn deserialize_loose_bool<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Bool(bool),
        Text(String),
    }

    match Option::<Loose>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Loose::Bool(b)) => Ok(Some(b)),
        Some(Loose::Text(s)) => match s.as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            other => Err(serde::de::Error::custom(format!(
                "invalid boolean string: {other}"
            ))),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    const NONCE: &str = "flow-nonce";

    fn validator() -> ClaimsValidator {
        let config = test_config();
        ClaimsValidator::new(&config.provider, &config.claims)
    }

    fn claims_at(now: i64) -> VerifiedClaims {
        VerifiedClaims {
            iss: "https://idp.example.com".to_string(),
            aud: vec!["com.example.app".to_string()],
            sub: "001234.abcd".to_string(),
            exp: now + 600,
            iat: now,
            nonce: Some(NONCE.to_string()),
            email: Some("  User@Example.com ".to_string()),
            email_verified: Some(true),
        }
    }

    fn violation(claims: &VerifiedClaims, now: DateTime<Utc>) -> ClaimViolation {
        match validator().validate(claims, NONCE, now) {
            Err(AuthEngineError::ClaimValidationFailed { reason }) => reason,
            other => panic!("expected claim failure, got {other:?}"),
        }
    }

    #[test]
    fn valid_claims_produce_normalized_identity() {
        let now = Utc::now();
        let identity = validator()
            .validate(&claims_at(now.timestamp()), NONCE, now)
            .unwrap();
        assert_eq!(identity.external_subject, "001234.abcd");
        assert_eq!(identity.email.as_deref(), Some("user@example.com"));
        assert!(identity.email_verified);
    }

    #[test]
    fn issuer_compared_exactly() {
        let now = Utc::now();
        for iss in ["https://idp.example.com/", "HTTPS://idp.example.com", "https://idp.example.com "] {
            let mut claims = claims_at(now.timestamp());
            claims.iss = iss.to_string();
            assert_eq!(violation(&claims, now), ClaimViolation::Issuer, "accepted {iss:?}");
        }
    }

    #[test]
    fn wrong_issuer() {
        let now = Utc::now();
        let mut claims = claims_at(now.timestamp());
        claims.iss = "https://evil.example.com".to_string();
        assert_eq!(violation(&claims, now), ClaimViolation::Issuer);
        assert!(!validator().issuer_matches(&claims));
    }

    #[test]
    fn wrong_audience() {
        let now = Utc::now();
        let mut claims = claims_at(now.timestamp());
        claims.aud = vec!["com.other.app".to_string()];
        assert_eq!(violation(&claims, now), ClaimViolation::Audience);
    }

    #[test]
    fn empty_subject() {
        let now = Utc::now();
        let mut claims = claims_at(now.timestamp());
        claims.sub = String::new();
        assert_eq!(violation(&claims, now), ClaimViolation::Subject);
    }

    #[test]
    fn expired_beyond_skew() {
        let now = Utc::now();
        let mut claims = claims_at(now.timestamp() - 300);
        claims.exp = now.timestamp() - 31;
        assert_eq!(violation(&claims, now), ClaimViolation::Expired);
    }

    #[test]
    fn expired_within_skew_accepted() {
        let now = Utc::now();
        let mut claims = claims_at(now.timestamp() - 300);
        claims.exp = now.timestamp() - 10;
        assert!(validator().validate(&claims, NONCE, now).is_ok());
    }

    #[test]
    fn issued_in_future() {
        let now = Utc::now();
        let claims = claims_at(now.timestamp() + 120);
        assert_eq!(violation(&claims, now), ClaimViolation::IssuedInFuture);
    }

    #[test]
    fn stale_token() {
        let now = Utc::now();
        let mut claims = claims_at(now.timestamp() - 11 * 60);
        claims.exp = now.timestamp() + 3600;
        assert_eq!(violation(&claims, now), ClaimViolation::Stale);
    }

    #[test]
    fn nonce_missing_and_mismatch() {
        let now = Utc::now();
        let mut claims = claims_at(now.timestamp());
        claims.nonce = None;
        assert_eq!(violation(&claims, now), ClaimViolation::NonceMissing);

        claims.nonce = Some("other-nonce".to_string());
        assert_eq!(violation(&claims, now), ClaimViolation::NonceMismatch);
    }

    #[test]
    fn deserializes_string_audience_and_string_bool() {
        let json = r#"{
            "iss": "https://idp.example.com",
            "aud": "com.example.app",
            "sub": "001234.abcd",
            "exp": 2000000000,
            "iat": 1999999000,
            "nonce": "n",
            "email": "a@b.c",
            "email_verified": "true"
        }"#;
        let claims: VerifiedClaims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.aud, vec!["com.example.app"]);
        assert_eq!(claims.email_verified, Some(true));
    }

    #[test]
    fn deserializes_array_audience_and_missing_optionals() {
        let json = r#"{
            "iss": "https://idp.example.com",
            "aud": ["a", "com.example.app"],
            "sub": "s",
            "exp": 2000000000,
            "iat": 1999999000
        }"#;
        let claims: VerifiedClaims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.aud.len(), 2);
        assert!(claims.nonce.is_none());
        assert!(claims.email_verified.is_none());
    }

    #[test]
    fn rejects_garbage_bool_string() {
        let json = r#"{
            "iss": "i", "aud": "a", "sub": "s", "exp": 1, "iat": 1,
            "email_verified": "yes"
        }"#;
        assert!(serde_json::from_str::<VerifiedClaims>(json).is_err());
    }
}
