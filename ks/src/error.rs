//! Store error types

use thiserror::Error;

/// Errors raised by a storage backend
///
/// These never reach bus callers: the [`KvStore`](crate::KvStore) adapter logs
/// and absorbs them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Check if the store may recover on its own (busy database, contention)
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            StoreError::Sqlite(_) => false,
            StoreError::Io(_) => false,
            StoreError::Poisoned => false,
        }
    }
}
