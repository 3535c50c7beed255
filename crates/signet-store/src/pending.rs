//! Pending sign-in persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use signet_auth_engine::{PendingAuthRepository, PendingAuthRequest, RepoResult};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::time;

/// SQLite-backed [`PendingAuthRepository`].
///
/// Redemption is a single `DELETE ... RETURNING`, so two callbacks racing
/// on the same state cannot both receive the verifier.
#[derive(Clone)]
pub struct SqlitePendingAuthRepository {
    db: Database,
}

impl SqlitePendingAuthRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PendingAuthRepository for SqlitePendingAuthRepository {
    #[instrument(skip_all, fields(expires_at = %request.expires_at))]
    async fn put(&self, request: &PendingAuthRequest) -> RepoResult<()> {
        let request = request.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO pending_auth \
                         (state_hash, code_verifier, nonce, created_at, expires_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        request.state_hash,
                        request.code_verifier,
                        request.nonce,
                        time::to_millis(request.created_at),
                        time::to_millis(request.expires_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn take_once(
        &self,
        state_hash: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<PendingAuthRequest>> {
        let state_hash = state_hash.to_string();
        let taken = self
            .db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "DELETE FROM pending_auth WHERE state_hash = ?1 \
                         RETURNING state_hash, code_verifier, nonce, created_at, expires_at",
                        [&state_hash],
                        |row| {
                            Ok(PendingAuthRequest {
                                state_hash: row.get(0)?,
                                code_verifier: row.get(1)?,
                                nonce: row.get(2)?,
                                created_at: time::column(row, 3, "pending_auth.created_at")?,
                                expires_at: time::column(row, 4, "pending_auth.expires_at")?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await?;

        match taken {
            Some(request) if request.is_expired(now) => {
                debug!("expired pending sign-in discarded");
                Ok(None)
            }
            other => Ok(other),
        }
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self, now: DateTime<Utc>) -> RepoResult<u64> {
        let purged = self
            .db
            .execute(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM pending_auth WHERE expires_at <= ?1",
                    [time::to_millis(now)],
                )?)
            })
            .await?;
        Ok(purged as u64)
    }
}
