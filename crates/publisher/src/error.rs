//! Publisher error types.

use message_bus::BusError;
use thiserror::Error;

/// Errors that end a publisher run.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The bus stayed unreachable for the whole retry budget.
    #[error("Gave up publishing to '{topic}' after {attempts} attempts: {source}")]
    RetriesExhausted {
        topic: String,
        attempts: u32,
        #[source]
        source: BusError,
    },

    /// The bus or the serializer rejected the message itself.
    #[error("Message for topic '{topic}' was rejected: {reason}")]
    InvalidMessage { topic: String, reason: String },

    /// The enrichment source could not be set up.
    #[error("Content source error: {0}")]
    Content(String),
}

/// Result type for publisher operations.
pub type Result<T> = std::result::Result<T, PublishError>;
