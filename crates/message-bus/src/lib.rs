//! Publish/subscribe contract for the materialized-view pipeline.
//!
//! - [`MessageBus`] publishes keyed payloads and opens [`Subscription`]s
//! - [`Delivery`] wraps an [`Event`] that must be acknowledged
//! - [`InMemoryMessageBus`] is a partitioned, at-least-once reference bus

pub mod bus;
pub mod error;
pub mod event;
pub mod memory;

pub use bus::{
    Ack, Acknowledge, Delivery, DeliverySource, MessageBus, MessageBusExt, Subscription,
    partition_for,
};
pub use common::MessageId;
pub use error::{BusError, Result};
pub use event::{DeliveryToken, Event, Published};
pub use memory::InMemoryMessageBus;
