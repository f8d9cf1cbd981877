use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the backup subsystem.
///
/// Only `InvalidArgument` and `AlreadyRunning` reach an operator directly; the
/// rest are caught at the cycle boundary and logged.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Bad operator input. No state was changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `start` was called while a timer is already installed.
    #[error("backup timer already running")]
    AlreadyRunning,

    /// The directory to archive does not exist.
    #[error("source directory missing: {0}")]
    SourceMissing(PathBuf),

    /// Archive write or delete failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings could not be read or persisted.
    #[error("config io error: {0}")]
    ConfigIo(String),

    /// Settings record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Constructed outside a tokio runtime.
    #[error("no async runtime available: {0}")]
    Runtime(String),

    /// The scheduler worker has been shut down.
    #[error("backup scheduler is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, BackupError>;
