use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{DeliveryToken, Event, Published, Result};

/// Core trait for message bus clients.
///
/// Delivery is at-least-once: a subscriber may see the same event more than
/// once after a handler failure or a consumer restart. Ordering holds only
/// among events sharing a key. All implementations must be thread-safe.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a payload to `topic` under the partitioning `key`.
    ///
    /// Returns the id and token of the stored event. Fails with `Transient` when the
    /// bus is unreachable and `InvalidMessage` when the bus rejects the
    /// message itself.
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<Published>;

    /// Joins `consumer_group` on `topic`.
    ///
    /// Members of one group share the topic's partitions; every group
    /// receives every event.
    async fn subscribe(&self, topic: &str, consumer_group: &str) -> Result<Subscription>;
}

/// Extension trait providing convenience methods for message buses.
#[async_trait]
pub trait MessageBusExt: MessageBus {
    /// Serializes `payload` as JSON and publishes it.
    async fn publish_json<T: serde::Serialize + Sync>(
        &self,
        topic: &str,
        key: &str,
        payload: &T,
    ) -> Result<Published> {
        let bytes = serde_json::to_vec(payload).map_err(|e| crate::BusError::InvalidMessage {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        self.publish(topic, key, bytes).await
    }
}

// Blanket implementation for all MessageBus implementations
impl<T: MessageBus + ?Sized> MessageBusExt for T {}

/// Commits or rejects a delivery on behalf of the bus implementation.
pub trait Acknowledge: Send + Sync {
    /// Marks the delivery as processed. It will not be redelivered.
    fn ack(&self, token: DeliveryToken);

    /// Rejects the delivery. It will be delivered again.
    fn nack(&self, token: DeliveryToken);
}

/// A single delivered event awaiting acknowledgement.
///
/// Dropping a delivery without acknowledging it leaves it uncommitted; it is
/// redelivered once the partition is reassigned.
pub struct Delivery {
    pub event: Event,
    acker: Arc<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(event: Event, acker: Arc<dyn Acknowledge>) -> Self {
        Self { event, acker }
    }

    /// Commits the delivery.
    pub fn ack(self) {
        self.acker.ack(self.event.delivery_token);
    }

    /// Asks the bus to deliver this event again.
    pub fn nack(self) {
        self.acker.nack(self.event.delivery_token);
    }

    /// Splits the delivery into its event and a detached acknowledgement.
    pub fn into_parts(self) -> (Event, Ack) {
        let ack = Ack {
            token: self.event.delivery_token,
            acker: self.acker,
        };
        (self.event, ack)
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// Acknowledgement handle detached from its event.
pub struct Ack {
    token: DeliveryToken,
    acker: Arc<dyn Acknowledge>,
}

impl Ack {
    pub fn ack(self) {
        self.acker.ack(self.token);
    }

    pub fn nack(self) {
        self.acker.nack(self.token);
    }
}

/// Source of deliveries behind a [`Subscription`].
///
/// Dropping the source leaves the consumer group.
#[async_trait]
pub trait DeliverySource: Send {
    /// Waits for the next delivery. Returns `None` once the source is closed.
    async fn recv(&mut self) -> Option<Delivery>;
}

/// A cancellable subscription to a topic within a consumer group.
pub struct Subscription {
    topic: String,
    consumer_group: String,
    source: Box<dyn DeliverySource>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        consumer_group: impl Into<String>,
        source: Box<dyn DeliverySource>,
    ) -> Self {
        Self {
            topic: topic.into(),
            consumer_group: consumer_group.into(),
            source,
            cancel: CancellationToken::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Token that stops this subscription from yielding new deliveries.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the next delivery.
    ///
    /// Returns `None` after the subscription was cancelled or the bus closed it.
    pub async fn next(&mut self) -> Option<Delivery> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            delivery = self.source.recv() => delivery,
        }
    }

    /// Stops receiving deliveries and leaves the consumer group.
    ///
    /// Deliveries already handed out can still be acknowledged.
    pub fn unsubscribe(self) {
        self.cancel.cancel();
        tracing::debug!(
            topic = %self.topic,
            group = %self.consumer_group,
            "unsubscribed"
        );
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("consumer_group", &self.consumer_group)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Maps a key to one of `partitions` buckets with a stable FNV-1a hash.
///
/// The same key always lands in the same bucket, across processes and
/// releases, which keeps per-key ordering and key affinity intact.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let hash = key
        .bytes()
        .fold(OFFSET_BASIS, |h, b| (h ^ u32::from(b)).wrapping_mul(PRIME));
    hash % partitions.max(1)
}
