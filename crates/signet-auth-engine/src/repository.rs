//! Storage seams consumed by the engine.
//!
//! The engine never talks to a database directly. Storage collaborators
//! implement these traits; `signet-store` ships SQLite implementations and
//! [`crate::memory`] ships in-process ones.
//!
//! # Atomicity
//!
//! Three operations carry the engine's concurrency guarantees and must be
//! implemented as single atomic steps:
//!
//! - [`LockoutRepository::apply_failure`]: read-modify-write of one
//!   account's counters.
//! - [`SessionRepository::rotate`]: compare-and-swap on
//!   `rotated_at IS NULL` plus the insert of the successor, committed
//!   together. Exactly one of two racing refreshes may win.
//! - [`SessionRepository::create_within_limit`]: count, evict and insert
//!   under one transaction per account.
//!
//! [`PendingAuthRepository::take_once`] must likewise delete-and-return in
//! one step so a state token can be redeemed at most once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::SessionLimitPolicy;
use crate::lockout::LockoutPolicy;
use crate::model::{Account, LockoutState, PendingAuthRequest, Session};

/// Failure reported by a storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    /// The backend is busy, unreachable or timed out.
    #[error("storage unavailable: {reason}")]
    Unavailable { reason: String },

    /// A uniqueness constraint was violated.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// Any other backend failure.
    #[error("storage backend error: {reason}")]
    Backend { reason: String },
}

/// Alias for `Result<T, RepositoryError>`.
pub type RepoResult<T> = std::result::Result<T, RepositoryError>;

/// Result of [`SessionRepository::create_within_limit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitOutcome {
    /// The session was stored; `evicted` lists the sessions removed to make
    /// room, oldest first.
    Created { evicted: Vec<Session> },
    /// The account is at its limit and the policy is
    /// [`SessionLimitPolicy::Reject`]. Nothing was written.
    LimitReached,
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn find_by_external_subject(&self, subject: &str) -> RepoResult<Option<Account>>;

    async fn find_by_id(&self, id: &str) -> RepoResult<Option<Account>>;

    /// Insert a new account.
    ///
    /// Returns [`RepositoryError::Conflict`] if an account with the same
    /// `external_subject` already exists.
    async fn create(&self, account: &Account) -> RepoResult<()>;

    async fn update_last_login(&self, id: &str, at: DateTime<Utc>) -> RepoResult<()>;

    /// Replace the stored email and its verification flag.
    async fn refresh_email(&self, id: &str, email: &str, verified: bool) -> RepoResult<()>;
}

#[async_trait]
pub trait LockoutRepository: Send + Sync {
    /// Current state, or `None` if the account has never failed.
    async fn get_state(&self, account_id: &str) -> RepoResult<Option<LockoutState>>;

    /// Atomically apply [`LockoutPolicy::register_failure`] to the stored
    /// state (creating it lazily) and return the new state.
    async fn apply_failure(
        &self,
        account_id: &str,
        policy: &LockoutPolicy,
        now: DateTime<Utc>,
    ) -> RepoResult<LockoutState>;

    /// Reset all counters and clear any lock.
    async fn apply_success(&self, account_id: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Look up a session by refresh-token hash, whatever its state.
    async fn find_by_token_hash(&self, token_hash: &str) -> RepoResult<Option<Session>>;

    async fn find_by_id(&self, id: &str) -> RepoResult<Option<Session>>;

    /// Insert a session without limit enforcement.
    async fn create(&self, session: &Session) -> RepoResult<()>;

    /// Insert a session while keeping the account's active sessions at or
    /// below `limit`, in one atomic step.
    async fn create_within_limit(
        &self,
        session: &Session,
        limit: u32,
        policy: SessionLimitPolicy,
        now: DateTime<Utc>,
    ) -> RepoResult<LimitOutcome>;

    /// Set `rotated_at = at` only if it is currently unset.
    ///
    /// Returns `false` if the session was already rotated or no longer
    /// exists.
    async fn mark_rotated(&self, id: &str, at: DateTime<Utc>) -> RepoResult<bool>;

    /// [`mark_rotated`](Self::mark_rotated) on `previous_id` and insert
    /// `next`, as one atomic step.
    ///
    /// Returns `false`, writing nothing, if `previous_id` was already
    /// rotated or no longer exists. On error nothing is written either.
    async fn rotate(&self, previous_id: &str, next: &Session, at: DateTime<Utc>)
    -> RepoResult<bool>;

    /// Returns `true` if a row was deleted.
    async fn delete_by_id(&self, id: &str) -> RepoResult<bool>;

    /// Returns the number of rows deleted, rotated rows included.
    async fn delete_all_for_account(&self, account_id: &str) -> RepoResult<u64>;

    async fn count_active_for_account(&self, account_id: &str, now: DateTime<Utc>)
    -> RepoResult<u32>;

    /// Active sessions ordered by `created_at` ascending.
    async fn list_active_for_account(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<Vec<Session>>;

    /// Delete sessions past their expiry. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> RepoResult<u64>;
}

#[async_trait]
pub trait PendingAuthRepository: Send + Sync {
    /// Store a pending request keyed by its state hash, replacing any
    /// previous entry for the same hash.
    async fn put(&self, request: &PendingAuthRequest) -> RepoResult<()>;

    /// Remove and return the request for `state_hash` in one step.
    ///
    /// An expired entry is removed too, but reported as `None`.
    async fn take_once(
        &self,
        state_hash: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<PendingAuthRequest>>;

    /// Delete expired requests. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> RepoResult<u64>;
}
