use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CleanerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Backup failed: {0}")]
    BackupFailed(String),

    #[error("Backup not found: {}", .0.display())]
    BackupNotFound(PathBuf),

    #[error("Invalid backup {}: {reason}", .path.display())]
    InvalidBackup { path: PathBuf, reason: String },

    #[error("Preflight check failed: {0}")]
    Preflight(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CleanerError>;
