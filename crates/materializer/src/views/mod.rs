//! Materialized views built by this crate.

pub mod connection_mandates;
pub mod occurrences;

pub use connection_mandates::{ConnectionMandate, ConnectionMandatesView};
pub use occurrences::{NameOccurrence, OccurrenceCount, OccurrenceCounter};
