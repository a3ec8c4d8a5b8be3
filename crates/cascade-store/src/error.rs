//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database is locked by another writer; retryable.
    #[error("store busy")]
    Busy,

    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _)
                if matches!(
                    inner.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::Busy
            }
            _ => Self::Sqlite(e),
        }
    }
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
