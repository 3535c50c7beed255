//! Error types for the signet-store crate.
//!
//! Store internals return [`StoreError`] via [`StoreResult`]. At the
//! repository-trait boundary it is converted into the engine's
//! [`RepositoryError`].

use rusqlite::ErrorCode;
use signet_auth_engine::RepositoryError;
use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// A stored value could not be decoded.
    #[error("corrupt {column} value: {value}")]
    Corrupt { column: &'static str, value: i64 },

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl StoreError {
    /// SQLite reported the database busy or locked.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.sqlite_code(),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }

    /// A UNIQUE or PRIMARY KEY constraint rejected the write.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == ErrorCode::ConstraintViolation
                    && matches!(
                        err.extended_code,
                        rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                            | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    )
            }
            _ => false,
        }
    }

    fn sqlite_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Sqlite(err) => err.sqlite_error_code(),
            _ => None,
        }
    }
}

impl From<StoreError> for RepositoryError {
    fn from(err: StoreError) -> Self {
        if err.is_busy() {
            Self::Unavailable {
                reason: err.to_string(),
            }
        } else if err.is_unique_violation() {
            Self::Conflict {
                reason: err.to_string(),
            }
        } else if matches!(err, StoreError::TaskJoin(_)) {
            Self::Unavailable {
                reason: err.to_string(),
            }
        } else {
            Self::Backend {
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(code: std::os::raw::c_int) -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            None,
        ))
    }

    #[test]
    fn busy_maps_to_unavailable() {
        let err: RepositoryError = failure(rusqlite::ffi::SQLITE_BUSY).into();
        assert!(matches!(err, RepositoryError::Unavailable { .. }));
        let err: RepositoryError = failure(rusqlite::ffi::SQLITE_LOCKED).into();
        assert!(matches!(err, RepositoryError::Unavailable { .. }));
    }

    #[test]
    fn unique_maps_to_conflict() {
        let err: RepositoryError = failure(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE).into();
        assert!(matches!(err, RepositoryError::Conflict { .. }));
    }

    #[test]
    fn other_constraints_are_backend_errors() {
        let err: RepositoryError = failure(rusqlite::ffi::SQLITE_CONSTRAINT_NOTNULL).into();
        assert!(matches!(err, RepositoryError::Backend { .. }));
    }

    #[test]
    fn join_failure_is_unavailable() {
        let err: RepositoryError = StoreError::TaskJoin("cancelled".to_string()).into();
        assert!(matches!(err, RepositoryError::Unavailable { .. }));
    }
}
