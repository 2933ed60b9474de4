use std::sync::Arc;
use std::time::Duration;

use common::RetryPolicy;
use message_bus::{BusError, MessageBus, Published};
use tokio_util::sync::CancellationToken;

use crate::content::{ContentSource, StaticContent};
use crate::factory::MessageFactory;
use crate::{PublishError, Result};

/// Settings for a publisher run.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub topic: String,
    /// Delay between two sends.
    pub interval: Duration,
    /// Number of messages to send. None runs until cancelled.
    pub count: Option<u64>,
    pub retry: RetryPolicy,
}

impl PublisherConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            interval: Duration::from_millis(700),
            count: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub sent: u64,
    /// True if the run ended because it was cancelled.
    pub cancelled: bool,
}

/// Emits synthetic events for one topic.
pub struct Publisher<B> {
    bus: B,
    factory: Arc<dyn MessageFactory>,
    content: Arc<dyn ContentSource>,
    config: PublisherConfig,
}

impl<B: MessageBus> Publisher<B> {
    pub fn new(bus: B, factory: impl MessageFactory + 'static, config: PublisherConfig) -> Self {
        Self {
            bus,
            factory: Arc::new(factory),
            content: Arc::new(StaticContent::empty()),
            config,
        }
    }

    /// Enriches every message with text from `content`.
    pub fn with_content(mut self, content: Arc<dyn ContentSource>) -> Self {
        self.content = content;
        self
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publishes until the configured count is reached or `cancel` fires.
    ///
    /// Cancellation stops scheduling new sends; a send already under way
    /// completes first. A send whose retries run out ends the run with an
    /// error.
    #[tracing::instrument(skip_all, fields(topic = %self.config.topic))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<PublishReport> {
        let mut sent = 0;
        loop {
            if self.config.count.is_some_and(|count| sent >= count) {
                tracing::info!(sent, "done publishing");
                return Ok(PublishReport {
                    sent,
                    cancelled: false,
                });
            }
            if cancel.is_cancelled() {
                break;
            }

            self.publish_one(sent + 1).await?;
            sent += 1;

            if self.config.count.is_some_and(|count| sent >= count) {
                continue;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.interval) => {}
            }
        }

        tracing::info!(sent, "publishing cancelled");
        Ok(PublishReport {
            sent,
            cancelled: true,
        })
    }

    /// Builds and publishes the message with the given sequence number.
    pub async fn publish_one(&self, sequence: u64) -> Result<Published> {
        let topic = self.config.topic.as_str();
        let text = self.content.next_text().await;
        let message = self.factory.create(sequence, &text);
        let payload =
            serde_json::to_vec(&message.payload).map_err(|e| PublishError::InvalidMessage {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let key = message.key.as_str();
        let result = self
            .config
            .retry
            .retry(
                |_| self.bus.publish(topic, key, payload.clone()),
                BusError::is_retryable,
            )
            .await;

        match result {
            Ok(published) => {
                metrics::counter!("publisher_messages_total", "topic" => topic.to_string(), "outcome" => "sent")
                    .increment(1);
                tracing::debug!(
                    key,
                    sequence,
                    token = %published.token,
                    message_id = %published.message_id,
                    "published"
                );
                Ok(published)
            }
            Err(failure) => {
                metrics::counter!("publisher_messages_total", "topic" => topic.to_string(), "outcome" => "failed")
                    .increment(1);
                tracing::error!(
                    key,
                    sequence,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "publish failed"
                );
                Err(match failure.error {
                    BusError::InvalidMessage { reason, .. } => PublishError::InvalidMessage {
                        topic: topic.to_string(),
                        reason,
                    },
                    error @ BusError::Transient(_) => PublishError::RetriesExhausted {
                        topic: topic.to_string(),
                        attempts: failure.attempts,
                        source: error,
                    },
                })
            }
        }
    }
}
