//! Wires the bus, stores, materializers and demo publishers of one process.

use std::sync::Arc;
use std::time::Duration;

use materializer::{
    ConcurrencyControl, ConnectionMandatesView, Dispatch, MaterializeError, Materializer,
    MaterializerConfig, MaterializerHandle, OccurrenceCounter, Progress,
};
use message_bus::InMemoryMessageBus;
use publisher::{
    ContentSource, HttpContent, MandateFactory, NameFactory, PublishError, PublishReport,
    Publisher, PublisherConfig, StaticContent,
};
use state_store::InMemoryStateStore;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, CounterDiscipline};
use crate::routes::greeting::Greeter;
use crate::routes::records::RecordQuery;

const MANDATE_CONNECTIONS: u64 = 5;
const MANDATE_REGIONS: [&str; 3] = ["eu", "us", "apac"];
const DEMO_NAMES: [&str; 3] = ["alice", "bob", "carol"];
const CONTENT_TIMEOUT: Duration = Duration::from_secs(5);
const MANDATE_NOT_FOUND: &str =
    "No mandate setting is known for this connection identifier in the IoT Platform service";
const COUNT_NOT_FOUND: &str = "No occurrences are known for this name";

/// The running read side: materializers feeding stores, plus optional
/// publishers producing demo traffic.
pub struct Pipeline {
    bus: InMemoryMessageBus,
    mandates: InMemoryStateStore,
    counters: InMemoryStateStore,
    mandates_handle: MaterializerHandle,
    counters_handle: MaterializerHandle,
    publishers: JoinSet<Result<PublishReport, PublishError>>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Starts both materializers and, if `PUBLISH_COUNT` is set, the publishers.
    pub async fn start(config: &Config) -> Result<Self, MaterializeError> {
        let bus = InMemoryMessageBus::with_partitions(config.bus_partitions);
        Self::start_on(bus, config).await
    }

    /// Starts the pipeline on an existing bus.
    pub async fn start_on(bus: InMemoryMessageBus, config: &Config) -> Result<Self, MaterializeError> {
        let mandates = InMemoryStateStore::new(config.store_name.clone());
        let counters = InMemoryStateStore::new(config.counter_store_name.clone());
        let workers = config.consumer_concurrency;

        // Replace views still need per-key order, so mandates use key affinity.
        let mandates_handle = Materializer::new(
            ConnectionMandatesView::new(),
            mandates.clone(),
            materializer_config(config, &config.mandates_topic)
                .with_dispatch(Dispatch::KeyAffinity { workers }),
        )?
        .start(&bus)
        .await?;

        let counters_handle = match start_counters(&bus, counters.clone(), config).await {
            Ok(handle) => handle,
            Err(error) => {
                if let Err(stop_error) = mandates_handle.shutdown().await {
                    tracing::warn!(error = %stop_error, "mandates materializer stopped with an error");
                }
                return Err(error);
            }
        };

        let cancel = CancellationToken::new();
        let mut publishers = JoinSet::new();
        if config.publish_count > 0 {
            let content = content_source(config);
            let mandate_publisher = Publisher::new(
                bus.clone(),
                MandateFactory::new(MANDATE_CONNECTIONS, MANDATE_REGIONS),
                publisher_config(config, &config.mandates_topic),
            )
            .with_content(Arc::clone(&content));
            let name_publisher = Publisher::new(
                bus.clone(),
                NameFactory::new(DEMO_NAMES),
                publisher_config(config, &config.names_topic),
            )
            .with_content(content);

            let token = cancel.child_token();
            publishers.spawn(async move { mandate_publisher.run(token).await });
            let token = cancel.child_token();
            publishers.spawn(async move { name_publisher.run(token).await });
        }

        tracing::info!(
            group = %config.consumer_group,
            discipline = ?config.counter_discipline,
            publishers = publishers.len(),
            "pipeline started"
        );

        Ok(Self {
            bus,
            mandates,
            counters,
            mandates_handle,
            counters_handle,
            publishers,
            cancel,
        })
    }

    pub fn bus(&self) -> &InMemoryMessageBus {
        &self.bus
    }

    pub fn mandates_store(&self) -> &InMemoryStateStore {
        &self.mandates
    }

    pub fn counters_store(&self) -> &InMemoryStateStore {
        &self.counters
    }

    pub fn mandates_progress(&self) -> watch::Receiver<Progress> {
        self.mandates_handle.progress()
    }

    pub fn counters_progress(&self) -> watch::Receiver<Progress> {
        self.counters_handle.progress()
    }

    /// Query routes for the views this pipeline maintains, as `(path, query)`.
    pub fn record_queries(&self, config: &Config) -> Vec<(String, RecordQuery)> {
        vec![
            (
                "/".to_string(),
                RecordQuery::new(
                    "connection_mandates",
                    MANDATE_NOT_FOUND,
                    config.id_param.clone(),
                    Arc::new(self.mandates.clone()),
                    config.store_timeout,
                ),
            ),
            (
                "/occurrences".to_string(),
                RecordQuery::new(
                    "occurrences",
                    COUNT_NOT_FOUND,
                    "name",
                    Arc::new(self.counters.clone()),
                    config.store_timeout,
                ),
            ),
        ]
    }

    /// Greeting route that feeds the occurrence counter of this pipeline.
    pub fn greeter(&self, config: &Config) -> Greeter {
        Greeter::new(
            Arc::new(self.bus.clone()),
            config.names_topic.clone(),
            Arc::new(self.counters.clone()),
            config.store_timeout,
        )
    }

    /// Stops publishers, then drains and stops both materializers.
    ///
    /// Returns the first materializer fault, if any.
    pub async fn shutdown(mut self) -> Result<(), MaterializeError> {
        self.cancel.cancel();
        while let Some(joined) = self.publishers.join_next().await {
            match joined {
                Ok(Ok(report)) => {
                    tracing::info!(sent = report.sent, cancelled = report.cancelled, "publisher finished")
                }
                Ok(Err(error)) => tracing::error!(%error, "publisher failed"),
                Err(error) => tracing::error!(%error, "publisher task failed"),
            }
        }

        let mandates = self.mandates_handle.shutdown().await;
        let counters = self.counters_handle.shutdown().await;
        tracing::info!("pipeline stopped");
        mandates.and(counters)
    }
}

async fn start_counters(
    bus: &InMemoryMessageBus,
    store: InMemoryStateStore,
    config: &Config,
) -> Result<MaterializerHandle, MaterializeError> {
    let workers = config.consumer_concurrency;
    let (control, dispatch) = match config.counter_discipline {
        CounterDiscipline::Optimistic => (
            OccurrenceCounter::optimistic().control(),
            Dispatch::Concurrent {
                max_in_flight: workers,
            },
        ),
        CounterDiscipline::SingleWriter => (
            ConcurrencyControl::SingleWriter,
            Dispatch::KeyAffinity { workers },
        ),
    };

    Materializer::new(
        OccurrenceCounter::new(control),
        store,
        materializer_config(config, &config.names_topic).with_dispatch(dispatch),
    )?
    .start(bus)
    .await
}

fn materializer_config(config: &Config, topic: &str) -> MaterializerConfig {
    MaterializerConfig::new(topic, config.consumer_group.clone())
        .with_fail_fast(config.fail_fast)
        .with_dedupe_window(config.dedupe_window)
}

fn publisher_config(config: &Config, topic: &str) -> PublisherConfig {
    PublisherConfig::new(topic)
        .with_interval(config.publish_interval)
        .with_count(config.publish_count)
}

fn content_source(config: &Config) -> Arc<dyn ContentSource> {
    let Some(url) = &config.greetings_url else {
        return Arc::new(StaticContent::empty());
    };
    match HttpContent::new(url.clone(), CONTENT_TIMEOUT) {
        Ok(content) => Arc::new(content),
        Err(error) => {
            tracing::warn!(%url, %error, "greetings source disabled");
            Arc::new(StaticContent::empty())
        }
    }
}
