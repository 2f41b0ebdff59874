//! Error types for the SQLite backend.

use retype_engine::{StateError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A thread panicked while holding the connection.
    #[error("database connection lock poisoned")]
    Poisoned,
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        let busy = matches!(
            &err,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        );
        if busy {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

impl From<DbError> for StateError {
    fn from(err: DbError) -> Self {
        StateError::Backend(err.to_string())
    }
}
