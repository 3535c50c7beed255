//! Session persistence.
//!
//! Rows are never updated except to set `rotated_at`. Rotation is a
//! conditional `UPDATE ... WHERE rotated_at IS NULL`; the affected-row count
//! tells the caller whether it won. [`SessionRepository::rotate`] runs that
//! update and the insert of the successor row in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use signet_auth_engine::{LimitOutcome, RepoResult, Session, SessionLimitPolicy, SessionRepository};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::StoreResult;
use crate::time;

const COLUMNS: &str = "id, account_id, refresh_token_hash, client_fingerprint, \
                       created_at, expires_at, last_used_at, rotated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        account_id: row.get(1)?,
        refresh_token_hash: row.get(2)?,
        client_fingerprint: row.get(3)?,
        created_at: time::column(row, 4, "sessions.created_at")?,
        expires_at: time::column(row, 5, "sessions.expires_at")?,
        last_used_at: time::column(row, 6, "sessions.last_used_at")?,
        rotated_at: time::opt_column(row, 7, "sessions.rotated_at")?,
    })
}

fn insert(conn: &Connection, session: &Session) -> StoreResult<()> {
    conn.execute(
        &format!("INSERT INTO sessions ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        rusqlite::params![
            session.id,
            session.account_id,
            session.refresh_token_hash,
            session.client_fingerprint,
            time::to_millis(session.created_at),
            time::to_millis(session.expires_at),
            time::to_millis(session.last_used_at),
            time::opt_to_millis(session.rotated_at),
        ],
    )?;
    Ok(())
}

/// Active sessions of one account, oldest first. Ties on `created_at` fall
/// back to insertion order.
fn active_for(conn: &Connection, account_id: &str, now: DateTime<Utc>) -> StoreResult<Vec<Session>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM sessions \
         WHERE account_id = ?1 AND rotated_at IS NULL AND expires_at > ?2 \
         ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![account_id, time::to_millis(now)], from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// SQLite-backed [`SessionRepository`].
#[derive(Clone)]
pub struct SqliteSessionRepository {
    db: Database,
}

impl SqliteSessionRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn find_where(&self, column: &'static str, value: &str) -> RepoResult<Option<Session>> {
        let value = value.to_string();
        let session = self
            .db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {COLUMNS} FROM sessions WHERE {column} = ?1"),
                        [&value],
                        from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(session)
    }
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    #[instrument(skip_all)]
    async fn find_by_token_hash(&self, token_hash: &str) -> RepoResult<Option<Session>> {
        self.find_where("refresh_token_hash", token_hash).await
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: &str) -> RepoResult<Option<Session>> {
        self.find_where("id", id).await
    }

    #[instrument(skip(self, session), fields(session_id = %session.id))]
    async fn create(&self, session: &Session) -> RepoResult<()> {
        let session = session.clone();
        self.db.execute(move |conn| insert(conn, &session)).await?;
        Ok(())
    }

    #[instrument(
        skip(self, session),
        fields(session_id = %session.id, account_id = %session.account_id)
    )]
    async fn create_within_limit(
        &self,
        session: &Session,
        limit: u32,
        policy: SessionLimitPolicy,
        now: DateTime<Utc>,
    ) -> RepoResult<LimitOutcome> {
        let session = session.clone();
        let outcome = self
            .db
            .transaction(move |tx| {
                let active = active_for(tx, &session.account_id, now)?;
                let limit = limit as usize;

                let mut evicted = Vec::new();
                if active.len() >= limit {
                    if policy == SessionLimitPolicy::Reject {
                        return Ok(LimitOutcome::LimitReached);
                    }
                    let excess = active.len() + 1 - limit;
                    for old in active.into_iter().take(excess) {
                        tx.execute("DELETE FROM sessions WHERE id = ?1", [&old.id])?;
                        evicted.push(old);
                    }
                }

                insert(tx, &session)?;
                Ok(LimitOutcome::Created { evicted })
            })
            .await?;

        if let LimitOutcome::Created { evicted } = &outcome {
            debug!(evicted = evicted.len(), "session stored within limit");
        }
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn mark_rotated(&self, id: &str, at: DateTime<Utc>) -> RepoResult<bool> {
        let id = id.to_string();
        let changed = self
            .db
            .execute(move |conn| {
                let at = time::to_millis(at);
                Ok(conn.execute(
                    "UPDATE sessions SET rotated_at = ?2, last_used_at = ?2 \
                     WHERE id = ?1 AND rotated_at IS NULL",
                    rusqlite::params![id, at],
                )?)
            })
            .await?;
        Ok(changed == 1)
    }

    #[instrument(skip(self, next), fields(session_id = %next.id))]
    async fn rotate(
        &self,
        previous_id: &str,
        next: &Session,
        at: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let previous_id = previous_id.to_string();
        let next = next.clone();
        let rotated = self
            .db
            .transaction(move |tx| {
                let at = time::to_millis(at);
                let changed = tx.execute(
                    "UPDATE sessions SET rotated_at = ?2, last_used_at = ?2 \
                     WHERE id = ?1 AND rotated_at IS NULL",
                    rusqlite::params![previous_id, at],
                )?;
                if changed != 1 {
                    return Ok(false);
                }
                insert(tx, &next)?;
                Ok(true)
            })
            .await?;
        Ok(rotated)
    }

    #[instrument(skip(self))]
    async fn delete_by_id(&self, id: &str) -> RepoResult<bool> {
        let id = id.to_string();
        let deleted = self
            .db
            .execute(move |conn| Ok(conn.execute("DELETE FROM sessions WHERE id = ?1", [&id])?))
            .await?;
        Ok(deleted > 0)
    }

    #[instrument(skip(self))]
    async fn delete_all_for_account(&self, account_id: &str) -> RepoResult<u64> {
        let account_id = account_id.to_string();
        let deleted = self
            .db
            .execute(move |conn| {
                Ok(conn.execute("DELETE FROM sessions WHERE account_id = ?1", [&account_id])?)
            })
            .await?;
        Ok(deleted as u64)
    }

    #[instrument(skip(self))]
    async fn count_active_for_account(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<u32> {
        let account_id = account_id.to_string();
        let count = self
            .db
            .execute(move |conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM sessions \
                     WHERE account_id = ?1 AND rotated_at IS NULL AND expires_at > ?2",
                    rusqlite::params![account_id, time::to_millis(now)],
                    |row| row.get::<_, u32>(0),
                )?)
            })
            .await?;
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn list_active_for_account(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<Vec<Session>> {
        let account_id = account_id.to_string();
        Ok(self
            .db
            .execute(move |conn| active_for(conn, &account_id, now))
            .await?)
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self, now: DateTime<Utc>) -> RepoResult<u64> {
        let purged = self
            .db
            .execute(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM sessions WHERE expires_at <= ?1",
                    [time::to_millis(now)],
                )?)
            })
            .await?;
        if purged > 0 {
            debug!(purged, "expired sessions purged");
        }
        Ok(purged as u64)
    }
}
