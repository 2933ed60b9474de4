use thiserror::Error;

use crate::Version;

/// Errors that can occur when interacting with the state store.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// A conditional write found a different version than expected.
    #[error("Version conflict on key '{key}': expected version {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: Version,
        actual: Version,
    },

    /// The store could not be reached. Retrying later may succeed.
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateStoreError {
    /// Returns true for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateStoreError::Unavailable(_))
    }

    /// Returns true for optimistic-concurrency conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateStoreError::Conflict { .. })
    }
}

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StateStoreError>;
