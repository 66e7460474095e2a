//! Tracker error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Storage error: {0}")]
    Storage(#[from] websql_storage::StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Invalid origin identifier: {0}")]
    InvalidOrigin(String),

    #[error("Unable to delete file {} for database {name}", path.display())]
    FileDeletion { name: String, path: PathBuf },
}
