//! Materializer error types.

use message_bus::{BusError, DeliveryToken};
use state_store::StateStoreError;
use thiserror::Error;

/// Errors that can occur while materializing events.
#[derive(Debug, Error)]
pub enum MaterializeError {
    /// An error occurred in the state store.
    #[error("State store error: {0}")]
    Store(#[from] StateStoreError),

    /// An error occurred in the message bus.
    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),

    /// The event payload does not match the view's schema.
    #[error("Invalid message on topic '{topic}' at {token}: {reason}")]
    InvalidMessage {
        topic: String,
        token: DeliveryToken,
        reason: String,
    },

    /// The value already stored under a key cannot be interpreted.
    #[error("Stored value for key '{key}' is unreadable: {reason}")]
    InvalidRecord { key: String, reason: String },

    /// The store stayed unavailable for the whole retry budget.
    #[error("State store unavailable for key '{key}' after {attempts} attempts: {source}")]
    StoreRetriesExhausted {
        key: String,
        attempts: u32,
        #[source]
        source: StateStoreError,
    },

    /// Optimistic writes kept conflicting with concurrent writers.
    #[error("Gave up on key '{key}' after {attempts} conflicting writes")]
    ConflictRetriesExhausted { key: String, attempts: u32 },

    /// The materializer was configured inconsistently.
    #[error("Invalid materializer configuration: {0}")]
    Configuration(String),

    /// A handler task panicked or was aborted.
    #[error("Handler task failed: {0}")]
    Task(String),
}

/// Result type for materializer operations.
pub type Result<T> = std::result::Result<T, MaterializeError>;
