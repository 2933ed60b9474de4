//! Types shared by every crate in the pipeline.

pub mod retry;
pub mod types;

pub use retry::{RetryFailure, RetryPolicy};
pub use types::MessageId;
