//! Materializer configuration.

use common::RetryPolicy;

use crate::handler::UpdateDiscipline;
use crate::{MaterializeError, Result};

const DEFAULT_DEDUPE_WINDOW: usize = 1024;

/// Whether handler invocations for one subscription may overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// One event at a time, in delivery order.
    Sequential,

    /// Up to `max_in_flight` events handled at once, regardless of key.
    Concurrent { max_in_flight: usize },

    /// Events routed by key to one of `workers` sequential workers, so one
    /// key is never handled by two invocations at once.
    KeyAffinity { workers: usize },
}

/// Settings for one materializer instance.
#[derive(Debug, Clone)]
pub struct MaterializerConfig {
    pub topic: String,
    pub consumer_group: String,
    pub dispatch: Dispatch,
    /// Backoff for transient store and bus failures.
    pub retry: RetryPolicy,
    /// Fault the materializer instead of dropping an event whose retries
    /// were exhausted.
    pub fail_fast: bool,
    /// Number of recently applied deliveries remembered to skip redeliveries.
    /// Zero disables the window.
    pub dedupe_window: usize,
}

impl MaterializerConfig {
    /// Creates a sequential, non-fail-fast configuration.
    pub fn new(topic: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            consumer_group: consumer_group.into(),
            dispatch: Dispatch::Sequential,
            retry: RetryPolicy::default(),
            fail_fast: false,
            dedupe_window: DEFAULT_DEDUPE_WINDOW,
        }
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_dedupe_window(mut self, size: usize) -> Self {
        self.dedupe_window = size;
        self
    }

    /// Checks the configuration against the discipline of the view it drives.
    pub fn validate(&self, discipline: UpdateDiscipline) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(MaterializeError::Configuration(
                "topic must not be empty".to_string(),
            ));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(MaterializeError::Configuration(
                "consumer group must not be empty".to_string(),
            ));
        }

        match self.dispatch {
            Dispatch::Concurrent { max_in_flight: 0 } | Dispatch::KeyAffinity { workers: 0 } => {
                Err(MaterializeError::Configuration(
                    "dispatch needs at least one handler slot".to_string(),
                ))
            }
            Dispatch::Concurrent { .. } if discipline.requires_single_writer() => {
                Err(MaterializeError::Configuration(
                    "single-writer views cannot use concurrent dispatch; use sequential or key-affinity dispatch"
                        .to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}
