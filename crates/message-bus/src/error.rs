use thiserror::Error;

/// Errors that can occur when interacting with the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus could not be reached. Retrying later may succeed.
    #[error("Message bus unavailable: {0}")]
    Transient(String),

    /// The bus rejected the message itself (bad topic, key or payload).
    #[error("Invalid message for topic '{topic}': {reason}")]
    InvalidMessage { topic: String, reason: String },
}

impl BusError {
    /// Returns true for failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Transient(_))
    }
}

/// Result type for message bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
