use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::MessageId;

/// Where a delivered message sits in the bus: partition and offset.
///
/// Opaque to handlers except for logging, ordering reasoning and
/// redelivery detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeliveryToken {
    pub partition: u32,
    pub offset: u64,
}

impl DeliveryToken {
    pub fn new(partition: u32, offset: u64) -> Self {
        Self { partition, offset }
    }
}

impl std::fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}@{}", self.partition, self.offset)
    }
}

/// Receipt for a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub message_id: MessageId,
    pub token: DeliveryToken,
}

/// A published message together with its delivery metadata.
///
/// Events are immutable once published; redeliveries carry the same
/// `message_id` and `delivery_token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier assigned at publish time.
    pub message_id: MessageId,

    /// Topic the event was published to.
    pub topic: String,

    /// Partitioning key. Events sharing a key are delivered in publish order.
    pub key: String,

    /// Raw payload bytes, usually JSON.
    pub payload: Vec<u8>,

    /// When the bus accepted the event.
    pub publish_time: DateTime<Utc>,

    /// Partition and offset of the event.
    pub delivery_token: DeliveryToken,
}

impl Event {
    /// Decodes the payload as JSON into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    /// Returns the payload as UTF-8 text for logging, lossily.
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
