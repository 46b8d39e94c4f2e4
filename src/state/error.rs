use std::path::PathBuf;

use thiserror::Error;

/// Item store failures.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to open item database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Schema setup or connection pragmas failed.
    #[error("Item database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A statement failed. Multi-row writes have been rolled back.
    #[error("Item database query failed: {0}")]
    Query(String),

    #[error("No tracked item with external id '{0}'")]
    UnknownItem(String),

    /// A thread panicked while holding the connection.
    #[error("Item database connection is poisoned")]
    Poisoned,

    #[error("Item database task failed: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    #[error("Item database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl StateError {
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
