//! Error types for the embedded store.

use thiserror::Error;

/// All possible errors from the embedded store.
///
/// Every variant carries a stable code (see [`StoreError::code`]) so that
/// callers can report failures without matching on variants, plus a
/// retryability hint that drives the initialization retry loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("database initialization failed: {0}")]
    InitFailed(String),

    #[error("database read failed: {0}")]
    ReadFailed(String),

    #[error("database write failed: {0}")]
    WriteFailed(String),

    #[error("legacy migration failed: {0}")]
    MigrationFailed(String),

    #[error("operation not supported for table '{table}': {reason}")]
    Unsupported { table: String, reason: String },
}

impl StoreError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::InitFailed(_) => "DB_INIT_FAILED",
            StoreError::ReadFailed(_) => "DB_READ_FAILED",
            StoreError::WriteFailed(_) => "DB_WRITE_FAILED",
            StoreError::MigrationFailed(_) => "DB_MIGRATION_FAILED",
            StoreError::Unsupported { .. } => "UNSUPPORTED_OP",
        }
    }

    /// Whether retrying the failed operation can reasonably succeed.
    ///
    /// Only initialization failures are retryable; runtime read/write
    /// failures on an open database are not.
    pub fn retryable(&self) -> bool {
        matches!(self, StoreError::InitFailed(_))
    }

    pub(crate) fn init(err: rusqlite::Error) -> Self {
        StoreError::InitFailed(err.to_string())
    }

    pub(crate) fn read(err: rusqlite::Error) -> Self {
        StoreError::ReadFailed(err.to_string())
    }

    pub(crate) fn write(err: rusqlite::Error) -> Self {
        StoreError::WriteFailed(err.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
