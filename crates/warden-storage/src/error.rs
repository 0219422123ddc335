//! Storage errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A policy value could not be encoded or decoded.
    #[error("Policy value encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No data directory available for {0}")]
    NoDataDir(&'static str),

    /// A thread panicked while holding the activity database.
    #[error("Activity database lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;
