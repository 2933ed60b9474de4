//! Greeting endpoint: counts a name by publishing it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use materializer::views::OccurrenceCount;
use message_bus::{MessageBus, MessageBusExt};
use serde_json::json;
use state_store::StateStore;

use crate::error::ApiError;

const DEFAULT_NAME: &str = "World";

/// Publishes greeted names and reads their running count.
#[derive(Clone)]
pub struct Greeter {
    pub bus: Arc<dyn MessageBus>,
    /// Topic the occurrence counter consumes.
    pub topic: String,
    /// Read-only handle on the occurrence counter's store.
    pub counters: Arc<dyn StateStore>,
    pub timeout: Duration,
}

impl Greeter {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topic: impl Into<String>,
        counters: Arc<dyn StateStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            bus,
            topic: topic.into(),
            counters,
            timeout,
        }
    }

    /// Times `name` was counted before this greeting.
    async fn prior_count(&self, name: &str) -> Result<u64, ApiError> {
        let record = tokio::time::timeout(self.timeout, self.counters.get(name))
            .await
            .map_err(|_| {
                ApiError::StoreUnavailable(format!(
                    "State store '{}' did not answer within {} ms",
                    self.counters.name(),
                    self.timeout.as_millis()
                ))
            })??;

        Ok(record
            .and_then(|record| OccurrenceCount::from_value(name, &record.value))
            .map_or(0, |stored| stored.count))
    }

    async fn greet(&self, name: &str) -> Result<String, ApiError> {
        let count = self.prior_count(name).await?.saturating_add(1);

        let published = self
            .bus
            .publish_json(&self.topic, name, &json!({ "name": name }))
            .await?;
        tracing::info!(
            name,
            topic = %self.topic,
            message_id = %published.message_id,
            token = %published.token,
            "published name"
        );

        Ok(format!("Hello {name} - greeting #{count}"))
    }
}

/// GET /greeting?name=<name>: greets the name and counts it.
pub async fn get(
    State(greeter): State<Arc<Greeter>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<String, ApiError> {
    let name = params
        .get("name")
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_NAME);

    let result = greeter.greet(name).await;
    let status = match &result {
        Ok(_) => "200".to_string(),
        Err(error) => error.status().as_u16().to_string(),
    };
    metrics::counter!("greeting_requests_total", "status" => status).increment(1);
    result
}
