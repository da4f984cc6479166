//! Error types for the local store, the write path, and the remote drivers.
//!
//! Local storage failures are fatal to the operation that triggered them.
//! Remote failures never are: the daemon logs them and leaves rows unsynced.

use thiserror::Error;

use crate::model::RowRef;

/// Local storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to prepare data directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Local database lock poisoned")]
    LockPoisoned,

    #[error("{entity} {local_id} not found")]
    NotFound { entity: &'static str, local_id: i64 },

    #[error("{0}")]
    Validation(String),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

impl StoreError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Outcome of a failed sync-aware write.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The row itself was committed locally, but an ancestor could not be
    /// marked stale. The data is safe; it may not be scheduled for
    /// replication until the ancestor is touched again.
    #[error("{committed} saved locally, but marking {failed_at} stale failed: {source}")]
    PartialCascade {
        committed: RowRef,
        failed_at: RowRef,
        #[source]
        source: rusqlite::Error,
    },
}

impl WriteError {
    /// The committed row, when the write reached the local store.
    pub fn committed(&self) -> Option<RowRef> {
        match self {
            Self::PartialCascade { committed, .. } => Some(*committed),
            Self::Store(_) => None,
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Self::PartialCascade { .. })
    }
}

impl From<rusqlite::Error> for WriteError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(e))
    }
}

/// Remote store errors. None of these are fatal to a caller.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote store not configured")]
    Offline,

    #[error("Cannot reach remote store: {0}")]
    Unreachable(String),

    #[error("Remote store rejected the payload: {0}")]
    Rejected(String),

    #[error("Remote transaction failed: {0}")]
    Transaction(String),

    #[error("Invalid response from remote store: {0}")]
    Decode(String),
}

impl From<rusqlite::Error> for RemoteError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Transaction(e.to_string())
    }
}
