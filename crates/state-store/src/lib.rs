//! Key-value state store contract for materialized views.
//!
//! - [`StateStore`] reads, conditionally writes and deletes JSON records
//! - [`SaveOptions`] carries the expected version for optimistic concurrency
//! - [`InMemoryStateStore`] is a reference store with fault injection

pub mod error;
pub mod memory;
pub mod record;
pub mod store;

pub use error::{Result, StateStoreError};
pub use memory::InMemoryStateStore;
pub use record::{StoredRecord, Version};
pub use store::{SaveOptions, SaveRequest, StateStore, StateStoreExt};
