//! Sign-in orchestration.
//!
//! [`AuthFlow`] composes the PKCE store, claims validator, lockout guard
//! and session manager into the operations an HTTP layer calls:
//!
//! ```text
//! initiate  ──► PkceStore::begin ──► authorization URL
//!
//! complete  ──► PkceStore::complete ──► TokenExchangeClient::exchange
//!           ──► (known account?) LockoutGuard::check_locked
//!           ──► ClaimsValidator::validate ──► find-or-create Account
//!           ──► LockoutGuard::record_success ──► SessionManager::create
//!
//! refresh   ──► SessionManager::refresh   (lockout not consulted)
//! ```
//!
//! Failed claim validation counts toward the lockout of the account the
//! claims name, provided they come from the configured issuer and the
//! account already exists. Failures that cannot be tied to an account
//! (bad state, provider errors, unknown subjects) are audited only.

use std::sync::Arc;

use chrono::Utc;
use url::Url;
use uuid::Uuid;

use crate::audit::{AuditSink, AuthEvent};
use crate::claims::{ClaimsValidator, Identity, VerifiedClaims};
use crate::config::{EngineConfig, ProviderConfig};
use crate::deadline::bounded;
use crate::error::{AuthEngineError, Result};
use crate::exchange::TokenExchangeClient;
use crate::lockout::{LockedStatus, LockoutGuard, LockoutPolicy};
use crate::model::{Account, Fingerprint, Session};
use crate::pkce::PkceStore;
use crate::repository::{
    AccountRepository, LockoutRepository, PendingAuthRepository, RepositoryError,
    SessionRepository,
};
use crate::session::{IssuedCredentials, Rotation, SessionManager};
use crate::token::AccessClaims;

/// Everything [`AuthFlow`] talks to.
#[derive(Clone)]
pub struct AuthFlowDeps {
    pub accounts: Arc<dyn AccountRepository>,
    pub lockouts: Arc<dyn LockoutRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub pending: Arc<dyn PendingAuthRepository>,
    pub exchange: Arc<dyn TokenExchangeClient>,
    pub audit: Arc<dyn AuditSink>,
}

/// Result of [`AuthFlow::initiate`].
#[derive(Debug, Clone)]
pub struct SignInStart {
    /// Where to send the user agent.
    pub authorization_url: String,
    /// The `state` embedded in the URL, for callers that track it.
    pub state: String,
}

/// Result of a successful [`AuthFlow::complete`].
#[derive(Debug, Clone)]
pub struct SignIn {
    pub account: Account,
    /// Whether this sign-in created the account.
    pub new_account: bool,
    pub credentials: IssuedCredentials,
}

/// The sign-in, refresh and logout entry points.
pub struct AuthFlow {
    authorization_endpoint: Url,
    provider: ProviderConfig,
    pkce: PkceStore,
    claims: ClaimsValidator,
    lockout: LockoutGuard,
    sessions: SessionManager,
    accounts: Arc<dyn AccountRepository>,
    exchange: Arc<dyn TokenExchangeClient>,
    audit: Arc<dyn AuditSink>,
    timeout: std::time::Duration,
}

impl AuthFlow {
    /// Validate `config` and wire up the components.
    ///
    /// # Errors
    ///
    /// Returns [`AuthEngineError::InvalidConfig`] if `config` fails
    /// validation.
    pub fn new(config: EngineConfig, deps: AuthFlowDeps) -> Result<Self> {
        config.validate()?;
        let timeout = config.storage.operation_timeout();

        let authorization_endpoint =
            Url::parse(&config.provider.authorization_endpoint).map_err(|e| {
                AuthEngineError::InvalidConfig {
                    reason: format!("provider.authorization_endpoint: {e}"),
                }
            })?;

        let sessions = SessionManager::new(deps.sessions, config.session.clone(), timeout)?;

        tracing::info!(
            issuer = %config.provider.issuer,
            client_id = %config.provider.client_id,
            max_sessions = config.session.max_concurrent_sessions,
            limit_policy = ?config.session.limit_policy,
            "auth flow ready"
        );

        Ok(Self {
            authorization_endpoint,
            pkce: PkceStore::new(deps.pending, config.pkce.clone(), timeout),
            claims: ClaimsValidator::new(&config.provider, &config.claims),
            lockout: LockoutGuard::new(deps.lockouts, LockoutPolicy::from(&config.lockout), timeout),
            sessions,
            accounts: deps.accounts,
            exchange: deps.exchange,
            audit: deps.audit,
            provider: config.provider,
            timeout,
        })
    }

    // -- Sign-in ------------------------------------------------------------

    /// Start a sign-in and build the provider authorization URL.
    pub async fn initiate(&self) -> Result<SignInStart> {
        let challenge = self.pkce.begin().await?;

        let mut url = self.authorization_endpoint.clone();
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.provider.client_id);
            params.append_pair("redirect_uri", &self.provider.redirect_uri);
            if !self.provider.scopes.is_empty() {
                params.append_pair("scope", &self.provider.scopes.join(" "));
            }
            params.append_pair("state", &challenge.state);
            params.append_pair("nonce", &challenge.nonce);
            params.append_pair("code_challenge", &challenge.code_challenge);
            params.append_pair("code_challenge_method", "S256");
            if let Some(mode) = self.provider.response_mode.as_deref() {
                params.append_pair("response_mode", mode);
            }
        }

        Ok(SignInStart {
            authorization_url: url.into(),
            state: challenge.state,
        })
    }

    /// Finish a sign-in from the provider callback.
    ///
    /// `supplied_verifier` is for clients that hold the PKCE verifier
    /// themselves; it must match the stored one.
    ///
    /// # Errors
    ///
    /// Any [`AuthEngineError`] except `InvalidToken`, `TokenTheftDetected`
    /// and `DeviceMismatch`.
    pub async fn complete(
        &self,
        code: &str,
        state: &str,
        supplied_verifier: Option<&str>,
        fingerprint: &Fingerprint,
    ) -> Result<SignIn> {
        let grant = match self.pkce.complete(state, supplied_verifier).await {
            Ok(grant) => grant,
            Err(err) => return Err(self.sign_in_failed(None, err).await),
        };

        let claims = match bounded(
            self.timeout,
            "token_exchange.exchange",
            self.exchange.exchange(code, &grant.code_verifier),
        )
        .await
        {
            Ok(claims) => claims,
            Err(err) => return Err(self.sign_in_failed(None, err).await),
        };

        let known = self.attributable_account(&claims).await?;

        if let Some(account) = &known {
            if let LockedStatus::Locked {
                retry_after_secs, ..
            } = self.lockout.check_locked(&account.id).await?
            {
                self.audit
                    .record(AuthEvent::AccountLocked {
                        account_id: account.id.clone(),
                        retry_after_secs,
                    })
                    .await;
                return Err(AuthEngineError::AccountLocked { retry_after_secs });
            }
        }

        let identity = match self.claims.validate(&claims, &grant.nonce, Utc::now()) {
            Ok(identity) => identity,
            Err(err) => {
                if let Some(account) = &known {
                    self.count_failure(&account.id).await?;
                }
                let account_id = known.map(|a| a.id);
                return Err(self.sign_in_failed(account_id, err).await);
            }
        };

        let (account, new_account) = match known {
            Some(account) => (self.refresh_profile(account, &identity).await?, false),
            None => self.find_or_create(&identity).await?,
        };

        self.lockout.record_success(&account.id).await?;

        let credentials = match self.sessions.create(&account.id, fingerprint).await {
            Ok(credentials) => credentials,
            Err(err) => return Err(self.sign_in_failed(Some(account.id), err).await),
        };

        let now = Utc::now();
        bounded(
            self.timeout,
            "accounts.update_last_login",
            self.accounts.update_last_login(&account.id, now),
        )
        .await?;

        for evicted in &credentials.evicted {
            self.audit
                .record(AuthEvent::SessionEvicted {
                    account_id: account.id.clone(),
                    session_id: evicted.id.clone(),
                })
                .await;
        }
        self.audit
            .record(AuthEvent::SessionCreated {
                account_id: account.id.clone(),
                session_id: credentials.session.id.clone(),
                new_account,
            })
            .await;

        tracing::info!(
            account_id = %account.id,
            session_id = %credentials.session.id,
            new_account,
            "sign-in completed"
        );

        Ok(SignIn {
            account: Account {
                last_login_at: Some(now),
                ..account
            },
            new_account,
            credentials,
        })
    }

    // -- Session continuation -----------------------------------------------

    /// Rotate a refresh token. Lockout is not consulted.
    pub async fn refresh(&self, refresh_token: &str, fingerprint: &Fingerprint) -> Result<Rotation> {
        match self.sessions.rotate(refresh_token, fingerprint).await {
            Ok(rotation) => {
                let session = &rotation.credentials.session;
                self.audit
                    .record(AuthEvent::SessionRefreshed {
                        account_id: session.account_id.clone(),
                        previous_session_id: rotation.previous_session_id.clone(),
                        session_id: session.id.clone(),
                    })
                    .await;
                Ok(rotation)
            }
            Err(failure) => {
                if let Some(compromised) = failure.compromised {
                    self.audit
                        .record(AuthEvent::TokenTheftDetected {
                            account_id: compromised.account_id,
                            session_id: compromised.id,
                        })
                        .await;
                }
                Err(failure.error)
            }
        }
    }

    /// Check an access token. Storage is not touched.
    pub fn authenticate(&self, access_token: &str) -> Result<AccessClaims> {
        self.sessions.verify_access_token(access_token)
    }

    // -- Logout -------------------------------------------------------------

    /// End one session. Returns whether it existed.
    pub async fn logout(&self, session_id: &str) -> Result<bool> {
        let removed = self.sessions.revoke_one(session_id).await?;
        if removed {
            self.audit
                .record(AuthEvent::SessionRevoked {
                    session_id: session_id.to_string(),
                })
                .await;
        }
        Ok(removed)
    }

    /// End every session of `account_id`. Returns how many were removed.
    pub async fn logout_everywhere(&self, account_id: &str) -> Result<u64> {
        let removed = self.sessions.revoke_all(account_id).await?;
        self.audit
            .record(AuthEvent::AllSessionsRevoked {
                account_id: account_id.to_string(),
                removed,
            })
            .await;
        Ok(removed)
    }

    /// Active sessions of `account_id`, oldest first.
    pub async fn active_sessions(&self, account_id: &str) -> Result<Vec<Session>> {
        self.sessions.active_sessions(account_id).await
    }

    // -- Internal helpers ---------------------------------------------------

    /// The local account the claims name, if the failure of this attempt
    /// can be charged to it.
    async fn attributable_account(&self, claims: &VerifiedClaims) -> Result<Option<Account>> {
        if !self.claims.issuer_matches(claims) || claims.sub.trim().is_empty() {
            return Ok(None);
        }
        bounded(
            self.timeout,
            "accounts.find_by_external_subject",
            self.accounts.find_by_external_subject(&claims.sub),
        )
        .await
    }

    async fn count_failure(&self, account_id: &str) -> Result<()> {
        if let LockedStatus::Locked {
            retry_after_secs, ..
        } = self.lockout.record_failure(account_id).await?
        {
            self.audit
                .record(AuthEvent::AccountLocked {
                    account_id: account_id.to_string(),
                    retry_after_secs,
                })
                .await;
        }
        Ok(())
    }

    async fn find_or_create(&self, identity: &Identity) -> Result<(Account, bool)> {
        let account = Account {
            id: Uuid::now_v7().to_string(),
            external_subject: identity.external_subject.clone(),
            email: identity.email.clone(),
            email_verified: identity.email_verified,
            created_at: Utc::now(),
            last_login_at: None,
        };

        // Keep the repository error intact so a uniqueness conflict can be
        // told apart from an outage.
        let created = bounded(self.timeout, "accounts.create", async {
            Ok::<_, AuthEngineError>(self.accounts.create(&account).await)
        })
        .await?;

        match created {
            Ok(()) => {
                tracing::info!(account_id = %account.id, "account created");
                Ok((account, true))
            }
            Err(RepositoryError::Conflict { .. }) => {
                // A concurrent first sign-in for the same subject won.
                let existing = bounded(
                    self.timeout,
                    "accounts.find_by_external_subject",
                    self.accounts
                        .find_by_external_subject(&identity.external_subject),
                )
                .await?
                .ok_or_else(|| {
                    AuthEngineError::unavailable("account vanished after creation conflict")
                })?;
                tracing::debug!(account_id = %existing.id, "lost account creation race");
                Ok((self.refresh_profile(existing, identity).await?, false))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn refresh_profile(&self, account: Account, identity: &Identity) -> Result<Account> {
        let Some(email) = identity.email.as_deref() else {
            return Ok(account);
        };
        if account.email.as_deref() == Some(email) && account.email_verified == identity.email_verified
        {
            return Ok(account);
        }
        bounded(
            self.timeout,
            "accounts.refresh_email",
            self.accounts
                .refresh_email(&account.id, email, identity.email_verified),
        )
        .await?;
        Ok(Account {
            email: Some(email.to_string()),
            email_verified: identity.email_verified,
            ..account
        })
    }

    async fn sign_in_failed(&self, account_id: Option<String>, err: AuthEngineError) -> AuthEngineError {
        tracing::info!(account_id = ?account_id, error = %err, "sign-in failed");
        self.audit
            .record(AuthEvent::SignInFailed {
                account_id,
                reason: err.to_string(),
            })
            .await;
        err
    }
}
