//! Error types for the sync engine.

use crate::gateway::GatewayError;
use tempo_store::StoreError;
use thiserror::Error;

/// All possible errors from the sync layer.
///
/// `Clone` because an in-flight sync pass is shared between joined callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("a sync pass is already running")]
    AlreadySyncing,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
