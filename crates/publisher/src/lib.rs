//! Synthetic event producer for demos and load.
//!
//! - [`Publisher`] emits events for one topic at a fixed interval
//! - [`MessageFactory`] turns a sequence number and enrichment text into a
//!   keyed JSON message
//! - [`ContentSource`] supplies the enrichment text, from a static list or a
//!   remote JSON array

pub mod content;
pub mod error;
pub mod factory;
pub mod publisher;

pub use content::{ContentSource, FALLBACK_TEXT, HttpContent, StaticContent};
pub use error::{PublishError, Result};
pub use factory::{MandateFactory, MessageFactory, NameFactory, OutgoingMessage};
pub use publisher::{PublishReport, Publisher, PublisherConfig};
