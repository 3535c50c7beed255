//! Schema migration system.
//!
//! Migrations are stored as static SQL strings keyed by version number.
//! The current version is tracked in a `_migrations` table so migrations
//! are idempotent and only run once.
//!
//! All timestamps are stored as INTEGER milliseconds since the Unix epoch.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// The latest schema version.
pub const LATEST_VERSION: u32 = 2;

/// All migrations in order. Add new migrations to the end of this array.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "accounts, lockout counters, sessions",
        sql: r#"
            CREATE TABLE accounts (
                id               TEXT PRIMARY KEY,
                external_subject TEXT NOT NULL UNIQUE,
                email            TEXT,
                email_verified   INTEGER NOT NULL DEFAULT 0,
                created_at       INTEGER NOT NULL,
                last_login_at    INTEGER
            );

            CREATE TABLE lockout_state (
                account_id      TEXT PRIMARY KEY REFERENCES accounts(id) ON DELETE CASCADE,
                failed_attempts INTEGER NOT NULL DEFAULT 0,
                lockout_count   INTEGER NOT NULL DEFAULT 0,
                locked_until    INTEGER,
                last_failed_at  INTEGER
            );

            CREATE TABLE sessions (
                id                 TEXT PRIMARY KEY,
                account_id         TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                refresh_token_hash TEXT NOT NULL,
                client_fingerprint TEXT NOT NULL,
                created_at         INTEGER NOT NULL,
                expires_at         INTEGER NOT NULL,
                last_used_at       INTEGER NOT NULL,
                rotated_at         INTEGER
            );
            CREATE UNIQUE INDEX idx_sessions_token_hash ON sessions(refresh_token_hash);
            CREATE INDEX idx_sessions_account ON sessions(account_id, created_at);
            CREATE INDEX idx_sessions_expires ON sessions(expires_at);
        "#,
    },
    Migration {
        version: 2,
        description: "pending sign-in requests",
        sql: r#"
            CREATE TABLE pending_auth (
                state_hash    TEXT PRIMARY KEY,
                code_verifier TEXT NOT NULL,
                nonce         TEXT NOT NULL,
                created_at    INTEGER NOT NULL,
                expires_at    INTEGER NOT NULL
            );
            CREATE INDEX idx_pending_auth_expires ON pending_auth(expires_at);
        "#,
    },
];

/// Apply all pending migrations.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }

    info!(new_version = LATEST_VERSION, "all migrations applied");
    Ok(())
}

/// Return the latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    ensure_migrations_table(conn)?;
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to read current version: {e}"),
    })
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })
}

/// Apply a single migration inside a transaction.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to begin transaction: {e}"),
        })?;

    let result = (|| -> StoreResult<()> {
        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: format!("SQL execution failed: {e}"),
            })?;

        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.description, now],
        )
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to record migration: {e}"),
        })?;

        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| StoreError::Migration {
                    version: migration.version,
                    message: format!("failed to commit: {e}"),
                })?;
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    #[test]
    fn migrations_are_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(window[1].version > window[0].version);
        }
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(LATEST_VERSION));
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn fresh_db_reports_version_zero() {
        let conn = setup_conn();
        assert_eq!(current_version(&conn).unwrap(), 0);
    }

    #[test]
    fn migrations_create_all_tables() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        for table in ["accounts", "lockout_state", "pending_auth", "sessions"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn token_hash_is_unique() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        conn.execute(
            "INSERT INTO accounts (id, external_subject, created_at) VALUES ('a', 's', 0)",
            [],
        )
        .unwrap();
        let insert = "INSERT INTO sessions (id, account_id, refresh_token_hash, client_fingerprint, \
                      created_at, expires_at, last_used_at) VALUES (?1, 'a', 'h', 'f', 0, 1, 0)";
        conn.execute(insert, ["s1"]).unwrap();
        assert!(conn.execute(insert, ["s2"]).is_err());
    }
}
