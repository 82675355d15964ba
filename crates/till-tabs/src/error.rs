//! Tab sync error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TabSyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] till_storage::StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tab sync destroyed")]
    Destroyed,
}
