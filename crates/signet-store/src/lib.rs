//! # signet-store
//!
//! SQLite implementations of the signet engine's repository traits.
//!
//! One [`Database`] handle (WAL mode, busy timeout, versioned migrations)
//! backs four repositories:
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  SqliteAccountRepository      accounts        │
//! │  SqliteLockoutRepository      lockout_state   │
//! │  SqliteSessionRepository      sessions        │
//! │  SqlitePendingAuthRepository  pending_auth    │
//! ├───────────────────────────────────────────────┤
//! │  Database (rusqlite, spawn_blocking)          │
//! │  Migrations (versioned, transactional)        │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use signet_store::SqliteStore;
//!
//! let store = SqliteStore::open("data/signet.db").await?;
//! let deps = AuthFlowDeps {
//!     accounts: Arc::new(store.accounts.clone()),
//!     lockouts: Arc::new(store.lockouts.clone()),
//!     sessions: Arc::new(store.sessions.clone()),
//!     pending: Arc::new(store.pending.clone()),
//!     exchange,
//!     audit: Arc::new(TracingAuditSink),
//! };
//! ```

pub mod accounts;
pub mod db;
pub mod error;
pub mod lockout;
pub mod migration;
pub mod pending;
pub mod sessions;
mod time;

use std::path::Path;

// ── re-exports ───────────────────────────────────────────────────────

pub use accounts::SqliteAccountRepository;
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use lockout::SqliteLockoutRepository;
pub use pending::SqlitePendingAuthRepository;
pub use sessions::SqliteSessionRepository;

/// All four repositories over one database.
#[derive(Clone)]
pub struct SqliteStore {
    pub db: Database,
    pub accounts: SqliteAccountRepository,
    pub lockouts: SqliteLockoutRepository,
    pub sessions: SqliteSessionRepository,
    pub pending: SqlitePendingAuthRepository,
}

impl SqliteStore {
    /// Wrap an already-migrated database.
    pub fn new(db: Database) -> Self {
        Self {
            accounts: SqliteAccountRepository::new(db.clone()),
            lockouts: SqliteLockoutRepository::new(db.clone()),
            sessions: SqliteSessionRepository::new(db.clone()),
            pending: SqlitePendingAuthRepository::new(db.clone()),
            db,
        }
    }

    /// Open the database at `path`, migrate it, and build the repositories.
    pub async fn open(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        Ok(Self::new(Database::open_and_migrate(path).await?))
    }

    /// A migrated in-memory store.
    pub async fn in_memory() -> StoreResult<Self> {
        let db = Database::open_in_memory()?;
        db.run_migrations().await?;
        Ok(Self::new(db))
    }
}
