//! Lockout counter persistence.
//!
//! [`SqliteLockoutRepository::apply_failure`] reads, transforms and writes
//! the row inside one `BEGIN IMMEDIATE` transaction, so concurrent failures
//! for the same account serialize on the database write lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use signet_auth_engine::{LockoutPolicy, LockoutRepository, LockoutState, RepoResult};
use tracing::instrument;

use crate::db::Database;
use crate::error::StoreResult;
use crate::time;

fn load(conn: &Connection, account_id: &str) -> StoreResult<Option<LockoutState>> {
    Ok(conn
        .query_row(
            "SELECT account_id, failed_attempts, lockout_count, locked_until, last_failed_at \
             FROM lockout_state WHERE account_id = ?1",
            [account_id],
            |row| {
                Ok(LockoutState {
                    account_id: row.get(0)?,
                    failed_attempts: row.get(1)?,
                    lockout_count: row.get(2)?,
                    locked_until: time::opt_column(row, 3, "lockout_state.locked_until")?,
                    last_failed_at: time::opt_column(row, 4, "lockout_state.last_failed_at")?,
                })
            },
        )
        .optional()?)
}

/// SQLite-backed [`LockoutRepository`].
#[derive(Clone)]
pub struct SqliteLockoutRepository {
    db: Database,
}

impl SqliteLockoutRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LockoutRepository for SqliteLockoutRepository {
    #[instrument(skip(self))]
    async fn get_state(&self, account_id: &str) -> RepoResult<Option<LockoutState>> {
        let account_id = account_id.to_string();
        Ok(self.db.execute(move |conn| load(conn, &account_id)).await?)
    }

    #[instrument(skip(self, policy))]
    async fn apply_failure(
        &self,
        account_id: &str,
        policy: &LockoutPolicy,
        now: DateTime<Utc>,
    ) -> RepoResult<LockoutState> {
        let account_id = account_id.to_string();
        let policy = policy.clone();
        let next = self
            .db
            .transaction(move |tx| {
                let current =
                    load(tx, &account_id)?.unwrap_or_else(|| LockoutState::new(account_id.as_str()));
                let next = policy.register_failure(&current, now);
                tx.execute(
                    "INSERT INTO lockout_state \
                         (account_id, failed_attempts, lockout_count, locked_until, last_failed_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(account_id) DO UPDATE SET \
                         failed_attempts = excluded.failed_attempts, \
                         lockout_count   = excluded.lockout_count, \
                         locked_until    = excluded.locked_until, \
                         last_failed_at  = excluded.last_failed_at",
                    rusqlite::params![
                        next.account_id,
                        next.failed_attempts,
                        next.lockout_count,
                        time::opt_to_millis(next.locked_until),
                        time::opt_to_millis(next.last_failed_at),
                    ],
                )?;
                Ok(next)
            })
            .await?;
        Ok(next)
    }

    #[instrument(skip(self))]
    async fn apply_success(&self, account_id: &str) -> RepoResult<()> {
        let account_id = account_id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE lockout_state \
                     SET failed_attempts = 0, lockout_count = 0, locked_until = NULL \
                     WHERE account_id = ?1",
                    [&account_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
