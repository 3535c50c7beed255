//! Account persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use signet_auth_engine::{Account, AccountRepository, RepoResult};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::time;

const COLUMNS: &str = "id, external_subject, email, email_verified, created_at, last_login_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        external_subject: row.get(1)?,
        email: row.get(2)?,
        email_verified: row.get(3)?,
        created_at: time::column(row, 4, "accounts.created_at")?,
        last_login_at: time::opt_column(row, 5, "accounts.last_login_at")?,
    })
}

/// SQLite-backed [`AccountRepository`].
#[derive(Clone)]
pub struct SqliteAccountRepository {
    db: Database,
}

impl SqliteAccountRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AccountRepository for SqliteAccountRepository {
    #[instrument(skip(self))]
    async fn find_by_external_subject(&self, subject: &str) -> RepoResult<Option<Account>> {
        let subject = subject.to_string();
        let account = self
            .db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {COLUMNS} FROM accounts WHERE external_subject = ?1"),
                        [&subject],
                        from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(account)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: &str) -> RepoResult<Option<Account>> {
        let id = id.to_string();
        let account = self
            .db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {COLUMNS} FROM accounts WHERE id = ?1"),
                        [&id],
                        from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(account)
    }

    #[instrument(skip(self, account), fields(account_id = %account.id))]
    async fn create(&self, account: &Account) -> RepoResult<()> {
        let account = account.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO accounts (id, external_subject, email, email_verified, created_at, last_login_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        account.id,
                        account.external_subject,
                        account.email,
                        account.email_verified,
                        time::to_millis(account.created_at),
                        time::opt_to_millis(account.last_login_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        debug!("account stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_last_login(&self, id: &str, at: DateTime<Utc>) -> RepoResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE accounts SET last_login_at = ?2 WHERE id = ?1",
                    rusqlite::params![id, time::to_millis(at)],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    #[instrument(skip(self, email))]
    async fn refresh_email(&self, id: &str, email: &str, verified: bool) -> RepoResult<()> {
        let id = id.to_string();
        let email = email.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE accounts SET email = ?2, email_verified = ?3 WHERE id = ?1",
                    rusqlite::params![id, email, verified],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
