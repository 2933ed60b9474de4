//! Event materializers for the query side of the pipeline.
//!
//! This crate turns a topic of events into a keyed read model:
//! - [`ViewHandler`] describes a view: schema, key, update discipline and fold
//! - [`Materializer`] drives a handler from a subscription into a state store
//! - [`MaterializerConfig`] states dispatch, retry and fail-fast behavior
//! - Two views: connection mandates (replace) and occurrence counters
//!   (read-modify-write)

pub mod config;
mod dedupe;
pub mod error;
pub mod handler;
pub mod materializer;
pub mod views;

pub use config::{Dispatch, MaterializerConfig};
pub use error::{MaterializeError, Result};
pub use handler::{ConcurrencyControl, Outcome, Progress, UpdateDiscipline, ViewHandler};
pub use materializer::{Materializer, MaterializerHandle, MaterializerState};
pub use views::{ConnectionMandatesView, OccurrenceCounter};
