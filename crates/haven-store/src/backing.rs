//! Backing store capability

use async_trait::async_trait;
use thiserror::Error;

use haven_core::ResilienceError;

/// Backing store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Stored value corrupt at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<StoreError> for ResilienceError {
    fn from(err: StoreError) -> Self {
        ResilienceError::StorageFailure(err.to_string())
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Async, unreliable key-value persistence
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn get_item(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set_item(&self, key: &str, value: String) -> StoreResult<()>;
    async fn remove_item(&self, key: &str) -> StoreResult<()>;
    /// Every key starting with `prefix`, including records written by an
    /// earlier session
    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}
