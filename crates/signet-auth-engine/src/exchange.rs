//! Authorization-code exchange with the identity provider.
//!
//! The engine only depends on the [`TokenExchangeClient`] trait: given the
//! authorization code and the PKCE verifier it must return the identity
//! token's claims, already signature-verified. [`HttpTokenExchange`] is the
//! stock implementation. It POSTs the code to the provider's token endpoint
//! with `reqwest` and hands the returned `id_token` to an
//! [`IdTokenVerifier`] for signature checking.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::claims::VerifiedClaims;
use crate::error::{AuthEngineError, Result};

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Redeems an authorization code for verified identity claims.
///
/// Implementations report transport, HTTP and signature failures as
/// [`AuthEngineError::ProviderAuthFailed`] and timeouts as
/// [`AuthEngineError::Unavailable`].
#[async_trait]
pub trait TokenExchangeClient: Send + Sync {
    async fn exchange(&self, code: &str, code_verifier: &str) -> Result<VerifiedClaims>;
}

/// Verifies an identity token's signature and decodes its claims.
#[async_trait]
pub trait IdTokenVerifier: Send + Sync {
    async fn verify(&self, id_token: &str) -> Result<VerifiedClaims>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Token-endpoint registration for [`HttpTokenExchange`].
#[derive(Clone, Serialize, Deserialize)]
pub struct HttpExchangeConfig {
    pub token_endpoint: String,
    pub client_id: String,
    /// Confidential clients only.
    #[serde(default)]
    pub client_secret: Option<String>,
    pub redirect_uri: String,
}

impl std::fmt::Debug for HttpExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpExchangeConfig")
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// Token endpoint success body. Only the identity token matters here; the
/// provider's own access and refresh tokens are discarded.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
}

/// Token endpoint error body (RFC 6749 §5.2).
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// [`TokenExchangeClient`] over HTTPS.
pub struct HttpTokenExchange {
    client: reqwest::Client,
    config: HttpExchangeConfig,
    verifier: Arc<dyn IdTokenVerifier>,
}

impl HttpTokenExchange {
    pub fn new(config: HttpExchangeConfig, verifier: Arc<dyn IdTokenVerifier>) -> Self {
        Self::with_client(reqwest::Client::new(), config, verifier)
    }

    /// Use a preconfigured `reqwest` client (proxies, custom roots).
    pub fn with_client(
        client: reqwest::Client,
        config: HttpExchangeConfig,
        verifier: Arc<dyn IdTokenVerifier>,
    ) -> Self {
        Self {
            client,
            config,
            verifier,
        }
    }

    fn form<'a>(&'a self, code: &'a str, code_verifier: &'a str) -> Vec<(&'a str, &'a str)> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        if let Some(secret) = self.config.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }
        params
    }
}

#[async_trait]
impl TokenExchangeClient for HttpTokenExchange {
    async fn exchange(&self, code: &str, code_verifier: &str) -> Result<VerifiedClaims> {
        tracing::debug!(token_endpoint = %self.config.token_endpoint, "exchanging authorization code");

        let response = self
            .client
            .post(&self.config.token_endpoint)
            .form(&self.form(code, code_verifier))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        let id_token = parse_token_response(status, &body)?;

        self.verifier.verify(&id_token).await
    }
}

/// Extract the `id_token` from a token endpoint response.
fn parse_token_response(status: reqwest::StatusCode, body: &str) -> Result<String> {
    if !status.is_success() {
        let reason = match serde_json::from_str::<TokenErrorResponse>(body) {
            Ok(err) => err.error_description.unwrap_or(err.error),
            Err(_) => format!("HTTP {status}"),
        };
        tracing::warn!(%status, %reason, "token endpoint rejected code");
        return Err(AuthEngineError::ProviderAuthFailed { reason });
    }

    let parsed: TokenResponse =
        serde_json::from_str(body).map_err(|e| AuthEngineError::ProviderAuthFailed {
            reason: format!("malformed token response: {e}"),
        })?;
    parsed
        .id_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthEngineError::ProviderAuthFailed {
            reason: "token response has no id_token".to_string(),
        })
}

fn transport_error(err: reqwest::Error) -> AuthEngineError {
    if err.is_timeout() {
        AuthEngineError::unavailable(format!("token endpoint timed out: {err}"))
    } else {
        AuthEngineError::ProviderAuthFailed {
            reason: format!("token endpoint unreachable: {err}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    struct RejectAll;

    #[async_trait]
    impl IdTokenVerifier for RejectAll {
        async fn verify(&self, _id_token: &str) -> Result<VerifiedClaims> {
            Err(AuthEngineError::ProviderAuthFailed {
                reason: "bad signature".to_string(),
            })
        }
    }

    fn exchange(secret: Option<&str>) -> HttpTokenExchange {
        HttpTokenExchange::new(
            HttpExchangeConfig {
                token_endpoint: "https://idp.example.com/auth/token".to_string(),
                client_id: "com.example.app".to_string(),
                client_secret: secret.map(String::from),
                redirect_uri: "https://app.example.com/auth/callback".to_string(),
            },
            Arc::new(RejectAll),
        )
    }

    #[test]
    fn form_carries_code_and_verifier() {
        let client = exchange(None);
        let form = client.form("the-code", "the-verifier");
        assert!(form.contains(&("grant_type", "authorization_code")));
        assert!(form.contains(&("code", "the-code")));
        assert!(form.contains(&("code_verifier", "the-verifier")));
        assert!(!form.iter().any(|(k, _)| *k == "client_secret"));
    }

    #[test]
    fn form_includes_secret_for_confidential_clients() {
        let client = exchange(Some("s3cret"));
        assert!(client.form("c", "v").contains(&("client_secret", "s3cret")));
    }

    #[test]
    fn debug_redacts_secret() {
        let client = exchange(Some("s3cret"));
        let rendered = format!("{:?}", client.config);
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn success_yields_id_token() {
        let body = r#"{
            "access_token": "provider-at",
            "token_type": "Bearer",
            "expires_in": 3600,
            "id_token": "header.payload.sig"
        }"#;
        assert_eq!(
            parse_token_response(StatusCode::OK, body).unwrap(),
            "header.payload.sig"
        );
    }

    #[test]
    fn missing_id_token_is_provider_failure() {
        let body = r#"{ "access_token": "provider-at" }"#;
        assert!(matches!(
            parse_token_response(StatusCode::OK, body),
            Err(AuthEngineError::ProviderAuthFailed { .. })
        ));
    }

    #[test]
    fn error_body_reason_is_surfaced() {
        let body = r#"{ "error": "invalid_grant", "error_description": "code expired" }"#;
        match parse_token_response(StatusCode::BAD_REQUEST, body) {
            Err(AuthEngineError::ProviderAuthFailed { reason }) => {
                assert_eq!(reason, "code expired")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_without_description_uses_code() {
        let body = r#"{ "error": "invalid_client" }"#;
        match parse_token_response(StatusCode::UNAUTHORIZED, body) {
            Err(AuthEngineError::ProviderAuthFailed { reason }) => {
                assert_eq!(reason, "invalid_client")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_json_error_mentions_status() {
        match parse_token_response(StatusCode::BAD_GATEWAY, "<html>") {
            Err(AuthEngineError::ProviderAuthFailed { reason }) => {
                assert!(reason.contains("502"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn http_exchange_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HttpTokenExchange>();
    }
}
