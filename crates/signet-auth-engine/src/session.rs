//! Session and token lifecycle.
//!
//! [`SessionManager`] creates sessions, rotates refresh tokens, detects
//! refresh-token reuse and enforces the per-account concurrency cap.
//!
//! # Rotation and reuse
//!
//! Every refresh marks the presented session `rotated_at = now` and creates
//! a new session row with a new refresh token. The rotated row is kept
//! until it expires. Presenting its token again means two parties hold the
//! same refresh token, so every session of the account is revoked and the
//! call fails with `TokenTheftDetected`.
//!
//! Rotation is a compare-and-swap on the session row, committed together
//! with the successor row; when two requests race on one token, exactly one
//! wins and the other is handled as reuse. A failed rotation writes nothing,
//! so the same token can be retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::{SessionConfig, SessionLimitPolicy};
use crate::crypto::constant_time_eq;
use crate::deadline::bounded;
use crate::error::{AuthEngineError, Result};
use crate::model::{Fingerprint, Session, after_secs};
use crate::repository::{LimitOutcome, SessionRepository};
use crate::token::{AccessClaims, AccessTokenSigner, RefreshToken, hash_refresh_token};

/// Credentials handed to a client after sign-in or refresh.
#[derive(Clone)]
pub struct IssuedCredentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until `access_token` expires.
    pub access_token_expires_in: u64,
    pub session: Session,
    /// Sessions removed to respect the concurrency cap, oldest first.
    pub evicted: Vec<Session>,
}

impl std::fmt::Debug for IssuedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredentials")
            .field("session", &self.session.id)
            .field("access_token_expires_in", &self.access_token_expires_in)
            .field("evicted", &self.evicted.len())
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful [`SessionManager::refresh`].
#[derive(Debug, Clone)]
pub struct Rotation {
    pub credentials: IssuedCredentials,
    /// Id of the session the presented token belonged to.
    pub previous_session_id: String,
}

/// Issues, rotates and revokes sessions.
pub struct SessionManager {
    repo: Arc<dyn SessionRepository>,
    signer: AccessTokenSigner,
    config: SessionConfig,
    timeout: Duration,
}

impl SessionManager {
    /// # Errors
    ///
    /// Returns [`AuthEngineError::InvalidConfig`] if the signing key is
    /// unusable.
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        config: SessionConfig,
        timeout: Duration,
    ) -> Result<Self> {
        let key = config.signing_key_bytes()?;
        let signer = AccessTokenSigner::new(&key, config.token_issuer.clone());
        Ok(Self {
            repo,
            signer,
            config,
            timeout,
        })
    }

    /// Start a new session for `account_id` bound to `fingerprint`.
    ///
    /// If the account already has `max_concurrent_sessions` active sessions
    /// the oldest is evicted first (or, with the `reject` policy, the call
    /// fails with [`AuthEngineError::MaxSessionsReached`]).
    pub async fn create(
        &self,
        account_id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<IssuedCredentials> {
        let now = Utc::now();
        let refresh = RefreshToken::generate(self.config.refresh_token_bytes)?;
        let session = self.new_session(account_id, fingerprint.as_str(), &refresh, now)?;

        let outcome = bounded(
            self.timeout,
            "sessions.create_within_limit",
            self.repo.create_within_limit(
                &session,
                self.config.max_concurrent_sessions,
                self.config.limit_policy,
                now,
            ),
        )
        .await?;

        let evicted = match outcome {
            LimitOutcome::Created { evicted } => evicted,
            LimitOutcome::LimitReached => {
                tracing::info!(
                    account_id,
                    limit = self.config.max_concurrent_sessions,
                    "session limit reached, new session rejected"
                );
                return Err(AuthEngineError::MaxSessionsReached {
                    limit: self.config.max_concurrent_sessions,
                });
            }
        };

        for old in &evicted {
            tracing::info!(account_id, session_id = %old.id, "oldest session evicted");
        }
        tracing::info!(account_id, session_id = %session.id, "session created");

        self.issue(session, refresh, evicted)
    }

    /// Exchange a refresh token for new credentials.
    ///
    /// # Errors
    ///
    /// - [`AuthEngineError::InvalidToken`]: unknown or expired token.
    /// - [`AuthEngineError::TokenTheftDetected`]: the token was already
    ///   rotated; every session of the account has been revoked.
    /// - [`AuthEngineError::DeviceMismatch`]: the fingerprint differs from
    ///   the session's. Nothing is rotated.
    /// - [`AuthEngineError::Unavailable`]: storage failure, including
    ///   failure of the theft-triggered revocation.
    pub async fn refresh(&self, refresh_token: &str, fingerprint: &Fingerprint) -> Result<Rotation> {
        self.rotate(refresh_token, fingerprint)
            .await
            .map_err(|failure| failure.error)
    }

    /// [`refresh`](Self::refresh), keeping the compromised session on
    /// reuse so the caller can report whose sessions were revoked.
    pub(crate) async fn rotate(
        &self,
        refresh_token: &str,
        fingerprint: &Fingerprint,
    ) -> std::result::Result<Rotation, RefreshFailure> {
        let now = Utc::now();
        let token_hash = hash_refresh_token(refresh_token);

        let session = bounded(
            self.timeout,
            "sessions.find_by_token_hash",
            self.repo.find_by_token_hash(&token_hash),
        )
        .await?
        .ok_or(AuthEngineError::InvalidToken)?;

        if session.is_expired(now) {
            return Err(AuthEngineError::InvalidToken.into());
        }

        if session.rotated_at.is_some() {
            return Err(self.revoke_for_theft(session).await);
        }

        if !constant_time_eq(
            session.client_fingerprint.as_bytes(),
            fingerprint.as_str().as_bytes(),
        ) {
            tracing::warn!(
                account_id = %session.account_id,
                session_id = %session.id,
                "refresh from a different client fingerprint"
            );
            return Err(AuthEngineError::DeviceMismatch.into());
        }

        let refresh = RefreshToken::generate(self.config.refresh_token_bytes)?;
        let next =
            self.new_session(&session.account_id, &session.client_fingerprint, &refresh, now)?;
        let rotated = match bounded(
            self.timeout,
            "sessions.rotate",
            self.repo.rotate(&session.id, &next, now),
        )
        .await
        {
            Ok(rotated) => rotated,
            Err(err) => self.landed(&next, err).await?,
        };
        if !rotated {
            return Err(self.rotation_lost(session).await);
        }

        tracing::info!(
            account_id = %session.account_id,
            previous_session_id = %session.id,
            session_id = %next.id,
            "refresh token rotated"
        );

        Ok(Rotation {
            credentials: self.issue(next, refresh, Vec::new())?,
            previous_session_id: session.id,
        })
    }

    /// Delete every session of `account_id`. Returns the number removed.
    pub async fn revoke_all(&self, account_id: &str) -> Result<u64> {
        let removed = bounded(
            self.timeout,
            "sessions.delete_all_for_account",
            self.repo.delete_all_for_account(account_id),
        )
        .await?;
        tracing::info!(account_id, removed, "all sessions revoked");
        Ok(removed)
    }

    /// Delete one session. Returns whether it existed.
    pub async fn revoke_one(&self, session_id: &str) -> Result<bool> {
        let removed = bounded(
            self.timeout,
            "sessions.delete_by_id",
            self.repo.delete_by_id(session_id),
        )
        .await?;
        tracing::info!(session_id, removed, "session revoked");
        Ok(removed)
    }

    /// Look up a session by id, whatever its state.
    pub async fn find(&self, session_id: &str) -> Result<Option<Session>> {
        bounded(
            self.timeout,
            "sessions.find_by_id",
            self.repo.find_by_id(session_id),
        )
        .await
    }

    /// Active sessions of `account_id`, oldest first.
    pub async fn active_sessions(&self, account_id: &str) -> Result<Vec<Session>> {
        bounded(
            self.timeout,
            "sessions.list_active_for_account",
            self.repo.list_active_for_account(account_id, Utc::now()),
        )
        .await
    }

    /// Number of active sessions of `account_id`.
    pub async fn active_count(&self, account_id: &str) -> Result<u32> {
        bounded(
            self.timeout,
            "sessions.count_active_for_account",
            self.repo.count_active_for_account(account_id, Utc::now()),
        )
        .await
    }

    /// Check an access token without touching storage.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims> {
        self.signer.verify(token, Utc::now())
    }

    pub fn limit_policy(&self) -> SessionLimitPolicy {
        self.config.limit_policy
    }

    // -- Internal helpers ---------------------------------------------------

    fn new_session(
        &self,
        account_id: &str,
        fingerprint: &str,
        refresh: &RefreshToken,
        now: chrono::DateTime<Utc>,
    ) -> Result<Session> {
        Ok(Session {
            id: Uuid::now_v7().to_string(),
            account_id: account_id.to_string(),
            refresh_token_hash: refresh.hash.clone(),
            client_fingerprint: fingerprint.to_string(),
            created_at: now,
            expires_at: after_secs(now, self.config.refresh_token_ttl_secs)?,
            last_used_at: now,
            rotated_at: None,
        })
    }

    fn issue(
        &self,
        session: Session,
        refresh: RefreshToken,
        evicted: Vec<Session>,
    ) -> Result<IssuedCredentials> {
        let access_token = self.signer.issue(
            &session.account_id,
            &session.id,
            session.created_at,
            self.config.access_token_ttl_secs,
        )?;
        Ok(IssuedCredentials {
            access_token,
            refresh_token: refresh.token,
            access_token_expires_in: self.config.access_token_ttl_secs,
            session,
            evicted,
        })
    }

    /// Settle a rotation whose outcome is unknown because the call failed
    /// or timed out. The write may still have committed; if the successor
    /// row exists the rotation stands, otherwise `err` is returned.
    async fn landed(&self, next: &Session, err: AuthEngineError) -> Result<bool> {
        match bounded(self.timeout, "sessions.find_by_id", self.repo.find_by_id(&next.id)).await {
            Ok(Some(_)) => {
                tracing::info!(session_id = %next.id, "rotation committed despite error");
                Ok(true)
            }
            _ => Err(err),
        }
    }

    /// The compare-and-swap on `session` failed. A concurrent refresh that
    /// rotated it is reuse; a row deleted in between (logout) is not.
    async fn rotation_lost(&self, session: Session) -> RefreshFailure {
        match self.find(&session.id).await {
            Ok(Some(current)) if current.rotated_at.is_some() => {
                self.revoke_for_theft(current).await
            }
            Ok(_) => {
                tracing::info!(session_id = %session.id, "session revoked during refresh");
                AuthEngineError::InvalidToken.into()
            }
            Err(err) => err.into(),
        }
    }

    /// Revoke every session of the account that owns `session`.
    ///
    /// The failure carries `TokenTheftDetected` once revocation has
    /// completed, or `Unavailable` if it could not.
    async fn revoke_for_theft(&self, session: Session) -> RefreshFailure {
        tracing::warn!(
            account_id = %session.account_id,
            session_id = %session.id,
            "rotated refresh token presented again, revoking all sessions"
        );
        let error = match self.revoke_all(&session.account_id).await {
            Ok(_) => AuthEngineError::TokenTheftDetected,
            Err(err) => {
                tracing::error!(
                    account_id = %session.account_id,
                    error = %err,
                    "theft response could not revoke sessions"
                );
                err
            }
        };
        RefreshFailure {
            error,
            compromised: Some(session),
        }
    }
}

/// A failed rotation.
#[derive(Debug)]
pub(crate) struct RefreshFailure {
    pub error: AuthEngineError,
    /// Set when the presented token had already been rotated.
    pub compromised: Option<Session>,
}

impl From<AuthEngineError> for RefreshFailure {
    fn from(error: AuthEngineError) -> Self {
        Self {
            error,
            compromised: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
