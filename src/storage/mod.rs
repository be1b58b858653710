//! Server-side persistence for the version authority and sync ledger
//!
//! Everything lives in one SQLite database behind a single connection.
//! Calls are synchronous; async callers wrap them in `spawn_blocking`.

pub mod authority;
pub mod db;
pub mod ledger;

use thiserror::Error;

use crate::api::StorageType;
use crate::version::InvalidVersion;

pub use db::Database;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Missing, deleted, or owned by someone else
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0} assets cannot be synced by content")]
    UnsupportedStorage(StorageType),

    /// A stored version is not `MAJOR.MINOR.PATCH`
    #[error("stored version is malformed: {0:?}")]
    InvalidVersion(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<InvalidVersion> for StoreError {
    fn from(err: InvalidVersion) -> Self {
        StoreError::InvalidVersion(err.0)
    }
}
