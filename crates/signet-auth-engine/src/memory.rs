//! In-process repository implementations.
//!
//! Each repository keeps its rows behind a single `std::sync::Mutex`, which
//! makes every trait method one atomic step. Suitable for tests, examples
//! and single-process deployments; state is lost on restart.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::SessionLimitPolicy;
use crate::lockout::LockoutPolicy;
use crate::model::{Account, LockoutState, PendingAuthRequest, Session};
use crate::repository::{
    AccountRepository, LimitOutcome, LockoutRepository, PendingAuthRepository, RepoResult,
    RepositoryError, SessionRepository,
};

fn lock<T>(mutex: &Mutex<T>) -> RepoResult<MutexGuard<'_, T>> {
    mutex.lock().map_err(|e| RepositoryError::Backend {
        reason: format!("mutex poisoned: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryAccountRepository {
    accounts: Mutex<HashMap<String, Account>>,
}

impl MemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountRepository for MemoryAccountRepository {
    async fn find_by_external_subject(&self, subject: &str) -> RepoResult<Option<Account>> {
        let accounts = lock(&self.accounts)?;
        Ok(accounts
            .values()
            .find(|a| a.external_subject == subject)
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> RepoResult<Option<Account>> {
        Ok(lock(&self.accounts)?.get(id).cloned())
    }

    async fn create(&self, account: &Account) -> RepoResult<()> {
        let mut accounts = lock(&self.accounts)?;
        if accounts
            .values()
            .any(|a| a.external_subject == account.external_subject)
        {
            return Err(RepositoryError::Conflict {
                reason: "external subject already linked".to_string(),
            });
        }
        if accounts.contains_key(&account.id) {
            return Err(RepositoryError::Conflict {
                reason: format!("account id {} already exists", account.id),
            });
        }
        accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn update_last_login(&self, id: &str, at: DateTime<Utc>) -> RepoResult<()> {
        if let Some(account) = lock(&self.accounts)?.get_mut(id) {
            account.last_login_at = Some(at);
        }
        Ok(())
    }

    async fn refresh_email(&self, id: &str, email: &str, verified: bool) -> RepoResult<()> {
        if let Some(account) = lock(&self.accounts)?.get_mut(id) {
            account.email = Some(email.to_string());
            account.email_verified = verified;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lockout
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryLockoutRepository {
    states: Mutex<HashMap<String, LockoutState>>,
}

impl MemoryLockoutRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the stored state for `account_id`, if any.
    pub fn snapshot(&self, account_id: &str) -> Option<LockoutState> {
        self.states.lock().ok()?.get(account_id).cloned()
    }
}

#[async_trait]
impl LockoutRepository for MemoryLockoutRepository {
    async fn get_state(&self, account_id: &str) -> RepoResult<Option<LockoutState>> {
        Ok(lock(&self.states)?.get(account_id).cloned())
    }

    async fn apply_failure(
        &self,
        account_id: &str,
        policy: &LockoutPolicy,
        now: DateTime<Utc>,
    ) -> RepoResult<LockoutState> {
        let mut states = lock(&self.states)?;
        let current = states
            .remove(account_id)
            .unwrap_or_else(|| LockoutState::new(account_id));
        let next = policy.register_failure(&current, now);
        states.insert(account_id.to_string(), next.clone());
        Ok(next)
    }

    async fn apply_success(&self, account_id: &str) -> RepoResult<()> {
        let mut states = lock(&self.states)?;
        if let Some(state) = states.get_mut(account_id) {
            state.failed_attempts = 0;
            state.lockout_count = 0;
            state.locked_until = None;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

struct SessionRow {
    /// Insertion order, breaks `created_at` ties.
    seq: u64,
    session: Session,
}

#[derive(Default)]
struct SessionTable {
    next_seq: u64,
    rows: HashMap<String, SessionRow>,
}

impl SessionTable {
    fn check_unique(&self, session: &Session) -> RepoResult<()> {
        if self.rows.contains_key(&session.id)
            || self
                .rows
                .values()
                .any(|r| r.session.refresh_token_hash == session.refresh_token_hash)
        {
            return Err(RepositoryError::Conflict {
                reason: "duplicate session id or token hash".to_string(),
            });
        }
        Ok(())
    }

    fn insert(&mut self, session: &Session) -> RepoResult<()> {
        self.check_unique(session)?;
        self.next_seq += 1;
        self.rows.insert(
            session.id.clone(),
            SessionRow {
                seq: self.next_seq,
                session: session.clone(),
            },
        );
        Ok(())
    }

    fn active_for(&self, account_id: &str, now: DateTime<Utc>) -> Vec<&SessionRow> {
        let mut rows: Vec<&SessionRow> = self
            .rows
            .values()
            .filter(|r| r.session.account_id == account_id && r.session.is_active(now))
            .collect();
        rows.sort_by(|a, b| {
            a.session
                .created_at
                .cmp(&b.session.created_at)
                .then(a.seq.cmp(&b.seq))
        });
        rows
    }
}

#[derive(Default)]
pub struct MemorySessionRepository {
    table: Mutex<SessionTable>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored rows, rotated and expired ones included.
    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the stored session `id`, if any.
    pub fn snapshot(&self, id: &str) -> Option<Session> {
        self.table
            .lock()
            .ok()?
            .rows
            .get(id)
            .map(|r| r.session.clone())
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn find_by_token_hash(&self, token_hash: &str) -> RepoResult<Option<Session>> {
        let table = lock(&self.table)?;
        Ok(table
            .rows
            .values()
            .find(|r| r.session.refresh_token_hash == token_hash)
            .map(|r| r.session.clone()))
    }

    async fn find_by_id(&self, id: &str) -> RepoResult<Option<Session>> {
        Ok(lock(&self.table)?.rows.get(id).map(|r| r.session.clone()))
    }

    async fn create(&self, session: &Session) -> RepoResult<()> {
        lock(&self.table)?.insert(session)
    }

    async fn create_within_limit(
        &self,
        session: &Session,
        limit: u32,
        policy: SessionLimitPolicy,
        now: DateTime<Utc>,
    ) -> RepoResult<LimitOutcome> {
        let mut table = lock(&self.table)?;
        let active: Vec<String> = table
            .active_for(&session.account_id, now)
            .into_iter()
            .map(|r| r.session.id.clone())
            .collect();

        let limit = limit as usize;
        let mut evicted = Vec::new();
        if active.len() >= limit {
            if policy == SessionLimitPolicy::Reject {
                return Ok(LimitOutcome::LimitReached);
            }
            // Nothing may be evicted for an insert that would fail.
            table.check_unique(session)?;
            let excess = active.len() + 1 - limit;
            for id in active.iter().take(excess) {
                if let Some(row) = table.rows.remove(id) {
                    evicted.push(row.session);
                }
            }
        }

        table.insert(session)?;
        Ok(LimitOutcome::Created { evicted })
    }

    async fn mark_rotated(&self, id: &str, at: DateTime<Utc>) -> RepoResult<bool> {
        let mut table = lock(&self.table)?;
        match table.rows.get_mut(id) {
            Some(row) if row.session.rotated_at.is_none() => {
                row.session.rotated_at = Some(at);
                row.session.last_used_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rotate(
        &self,
        previous_id: &str,
        next: &Session,
        at: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let mut table = lock(&self.table)?;
        let rotatable = table
            .rows
            .get(previous_id)
            .is_some_and(|r| r.session.rotated_at.is_none());
        if !rotatable {
            return Ok(false);
        }
        table.insert(next)?;
        if let Some(row) = table.rows.get_mut(previous_id) {
            row.session.rotated_at = Some(at);
            row.session.last_used_at = at;
        }
        Ok(true)
    }

    async fn delete_by_id(&self, id: &str) -> RepoResult<bool> {
        Ok(lock(&self.table)?.rows.remove(id).is_some())
    }

    async fn delete_all_for_account(&self, account_id: &str) -> RepoResult<u64> {
        let mut table = lock(&self.table)?;
        let before = table.rows.len();
        table.rows.retain(|_, r| r.session.account_id != account_id);
        Ok((before - table.rows.len()) as u64)
    }

    async fn count_active_for_account(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<u32> {
        Ok(lock(&self.table)?.active_for(account_id, now).len() as u32)
    }

    async fn list_active_for_account(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<Vec<Session>> {
        Ok(lock(&self.table)?
            .active_for(account_id, now)
            .into_iter()
            .map(|r| r.session.clone())
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> RepoResult<u64> {
        let mut table = lock(&self.table)?;
        let before = table.rows.len();
        table.rows.retain(|_, r| !r.session.is_expired(now));
        Ok((before - table.rows.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Pending sign-ins
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryPendingAuthRepository {
    pending: Mutex<HashMap<String, PendingAuthRequest>>,
}

impl MemoryPendingAuthRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry is stored under `state_hash`.
    pub fn contains_key(&self, state_hash: &str) -> bool {
        self.pending
            .lock()
            .map(|p| p.contains_key(state_hash))
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn verifier_for_state(&self, state: &str) -> Option<String> {
        let key = crate::crypto::sha256_b64(state);
        self.pending
            .lock()
            .ok()?
            .get(&key)
            .map(|p| p.code_verifier.clone())
    }
}

#[async_trait]
impl PendingAuthRepository for MemoryPendingAuthRepository {
    async fn put(&self, request: &PendingAuthRequest) -> RepoResult<()> {
        lock(&self.pending)?.insert(request.state_hash.clone(), request.clone());
        Ok(())
    }

    async fn take_once(
        &self,
        state_hash: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<PendingAuthRequest>> {
        let taken = lock(&self.pending)?.remove(state_hash);
        Ok(taken.filter(|p| !p.is_expired(now)))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> RepoResult<u64> {
        let mut pending = lock(&self.pending)?;
        let before = pending.len();
        pending.retain(|_, p| !p.is_expired(now));
        Ok((before - pending.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(id: &str, account: &str, created_at: DateTime<Utc>) -> Session {
        Session {
            id: id.to_string(),
            account_id: account.to_string(),
            refresh_token_hash: format!("hash-{id}"),
            client_fingerprint: "ua".to_string(),
            created_at,
            expires_at: created_at + Duration::days(1),
            last_used_at: created_at,
            rotated_at: None,
        }
    }

    fn account(id: &str, subject: &str) -> Account {
        Account {
            id: id.to_string(),
            external_subject: subject.to_string(),
            email: None,
            email_verified: false,
            created_at: Utc::now(),
            last_login_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_subject_conflicts() {
        let repo = MemoryAccountRepository::new();
        repo.create(&account("1", "sub")).await.unwrap();
        let err = repo.create(&account("2", "sub")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict { .. }));
    }

    #[tokio::test]
    async fn account_updates() {
        let repo = MemoryAccountRepository::new();
        repo.create(&account("1", "sub")).await.unwrap();
        let now = Utc::now();
        repo.update_last_login("1", now).await.unwrap();
        repo.refresh_email("1", "a@b.c", true).await.unwrap();

        let stored = repo.find_by_external_subject("sub").await.unwrap().unwrap();
        assert_eq!(stored.last_login_at, Some(now));
        assert_eq!(stored.email.as_deref(), Some("a@b.c"));
        assert!(stored.email_verified);
    }

    #[tokio::test]
    async fn duplicate_token_hash_conflicts() {
        let repo = MemorySessionRepository::new();
        let now = Utc::now();
        repo.create(&session("a", "acct", now)).await.unwrap();
        let mut dup = session("b", "acct", now);
        dup.refresh_token_hash = "hash-a".to_string();
        assert!(matches!(
            repo.create(&dup).await,
            Err(RepositoryError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn mark_rotated_is_compare_and_swap() {
        let repo = MemorySessionRepository::new();
        let now = Utc::now();
        repo.create(&session("a", "acct", now)).await.unwrap();

        assert!(repo.mark_rotated("a", now).await.unwrap());
        assert!(!repo.mark_rotated("a", now).await.unwrap());
        assert!(!repo.mark_rotated("missing", now).await.unwrap());
    }

    #[tokio::test]
    async fn rotate_marks_and_inserts_together() {
        let repo = MemorySessionRepository::new();
        let now = Utc::now();
        repo.create(&session("a", "acct", now)).await.unwrap();

        assert!(repo.rotate("a", &session("b", "acct", now), now).await.unwrap());
        assert!(repo.snapshot("a").unwrap().rotated_at.is_some());
        assert!(repo.snapshot("b").is_some());

        // Second rotation of the same row writes nothing.
        assert!(!repo.rotate("a", &session("c", "acct", now), now).await.unwrap());
        assert!(repo.snapshot("c").is_none());
        assert!(!repo.rotate("missing", &session("d", "acct", now), now).await.unwrap());
        assert!(repo.snapshot("d").is_none());
    }

    #[tokio::test]
    async fn failed_rotate_leaves_previous_row_untouched() {
        let repo = MemorySessionRepository::new();
        let now = Utc::now();
        repo.create(&session("a", "acct", now)).await.unwrap();
        repo.create(&session("b", "acct", now)).await.unwrap();

        let mut clash = session("c", "acct", now);
        clash.refresh_token_hash = "hash-b".to_string();
        assert!(matches!(
            repo.rotate("a", &clash, now).await,
            Err(RepositoryError::Conflict { .. })
        ));
        assert!(repo.snapshot("a").unwrap().rotated_at.is_none());
    }

    #[tokio::test]
    async fn conflicting_insert_evicts_nothing() {
        let repo = MemorySessionRepository::new();
        let now = Utc::now();
        repo.create(&session("old", "acct", now - Duration::minutes(10)))
            .await
            .unwrap();
        repo.create(&session("mid", "acct", now - Duration::minutes(5)))
            .await
            .unwrap();

        let mut clash = session("new", "acct", now);
        clash.refresh_token_hash = "hash-mid".to_string();
        assert!(matches!(
            repo.create_within_limit(&clash, 2, SessionLimitPolicy::EvictOldest, now)
                .await,
            Err(RepositoryError::Conflict { .. })
        ));
        assert!(repo.snapshot("old").is_some());
    }

    #[tokio::test]
    async fn eviction_picks_oldest_by_created_at() {
        let repo = MemorySessionRepository::new();
        let now = Utc::now();
        // Inserted out of order on purpose.
        repo.create(&session("mid", "acct", now - Duration::minutes(5)))
            .await
            .unwrap();
        repo.create(&session("old", "acct", now - Duration::minutes(10)))
            .await
            .unwrap();

        let outcome = repo
            .create_within_limit(
                &session("new", "acct", now),
                2,
                SessionLimitPolicy::EvictOldest,
                now,
            )
            .await
            .unwrap();
        match outcome {
            LimitOutcome::Created { evicted } => {
                assert_eq!(evicted.len(), 1);
                assert_eq!(evicted[0].id, "old");
            }
            LimitOutcome::LimitReached => panic!("expected eviction"),
        }
        assert_eq!(repo.count_active_for_account("acct", now).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let repo = MemorySessionRepository::new();
        let now = Utc::now();
        repo.create(&session("old", "acct", now - Duration::days(2)))
            .await
            .unwrap();
        repo.create(&session("fresh", "acct", now)).await.unwrap();

        assert_eq!(repo.purge_expired(now).await.unwrap(), 1);
        assert!(repo.snapshot("fresh").is_some());
    }

    #[tokio::test]
    async fn take_once_drops_expired_entries() {
        let repo = MemoryPendingAuthRepository::new();
        let now = Utc::now();
        repo.put(&PendingAuthRequest {
            state_hash: "h".to_string(),
            code_verifier: "v".to_string(),
            nonce: "n".to_string(),
            created_at: now - Duration::minutes(20),
            expires_at: now - Duration::minutes(10),
        })
        .await
        .unwrap();

        assert!(repo.take_once("h", now).await.unwrap().is_none());
        assert!(repo.is_empty());
    }
}
