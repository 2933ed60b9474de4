use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::RetryPolicy;
use materializer::views::OccurrenceCount;
use materializer::{
    ConcurrencyControl, ConnectionMandatesView, Dispatch, MaterializeError, Materializer,
    MaterializerConfig, MaterializerState, OccurrenceCounter, Outcome, Progress,
};
use message_bus::{
    DeliveryToken, Event, InMemoryMessageBus, MessageBus, MessageBusExt, MessageId, partition_for,
};
use serde_json::json;
use state_store::{
    InMemoryStateStore, SaveOptions, StateStore, StateStoreExt, StoredRecord, Version,
};
use tokio::sync::{Barrier, Notify, Semaphore, watch};

/// Store wrapper that holds the first `parties` reads at a barrier, so every
/// one of them sees the same prior value before any write lands.
#[derive(Clone)]
struct InterleavingStore {
    inner: InMemoryStateStore,
    barrier: Arc<Barrier>,
    parties: usize,
    reads: Arc<AtomicUsize>,
}

impl InterleavingStore {
    fn new(inner: InMemoryStateStore, parties: usize) -> Self {
        Self {
            inner,
            barrier: Arc::new(Barrier::new(parties)),
            parties,
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl StateStore for InterleavingStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> state_store::Result<Option<StoredRecord>> {
        let record = self.inner.get(key).await;
        if self.reads.fetch_add(1, Ordering::SeqCst) < self.parties {
            self.barrier.wait().await;
        }
        record
    }

    async fn save(
        &self,
        key: &str,
        value: serde_json::Value,
        options: SaveOptions,
    ) -> state_store::Result<Version> {
        self.inner.save(key, value, options).await
    }

    async fn delete(&self, key: &str) -> state_store::Result<()> {
        self.inner.delete(key).await
    }
}

/// Store wrapper that parks the first read until the test releases it, so a
/// handler is known to be in flight.
#[derive(Clone)]
struct GatedStore {
    inner: InMemoryStateStore,
    gated: Arc<AtomicBool>,
    entered: Arc<Notify>,
    release: Arc<Semaphore>,
}

impl GatedStore {
    fn new(inner: InMemoryStateStore) -> Self {
        Self {
            inner,
            gated: Arc::new(AtomicBool::new(true)),
            entered: Arc::new(Notify::new()),
            release: Arc::new(Semaphore::new(0)),
        }
    }

    /// Waits until the first read is parked.
    async fn parked(&self) {
        self.entered.notified().await;
    }

    fn open(&self) {
        self.release.add_permits(1);
    }
}

#[async_trait]
impl StateStore for GatedStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> state_store::Result<Option<StoredRecord>> {
        if self.gated.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            let _permit = self.release.acquire().await;
        }
        self.inner.get(key).await
    }

    async fn save(
        &self,
        key: &str,
        value: serde_json::Value,
        options: SaveOptions,
    ) -> state_store::Result<Version> {
        self.inner.save(key, value, options).await
    }

    async fn delete(&self, key: &str) -> state_store::Result<()> {
        self.inner.delete(key).await
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3).with_backoff(Duration::from_millis(1), Duration::from_millis(5))
}

fn name_event(offset: u64, name: &str) -> Event {
    Event {
        message_id: MessageId::new(),
        topic: "names".to_string(),
        key: name.to_string(),
        payload: serde_json::to_vec(&json!({ "name": name })).unwrap(),
        publish_time: Utc::now(),
        delivery_token: DeliveryToken::new(0, offset),
    }
}

async fn count_of(store: &InMemoryStateStore, key: &str) -> u64 {
    let record = store.get(key).await.unwrap().expect("counter missing");
    OccurrenceCount::from_value(key, &record.value)
        .expect("unreadable counter")
        .count
}

async fn wait_until(
    progress: &mut watch::Receiver<Progress>,
    done: impl FnMut(&Progress) -> bool,
) -> Progress {
    *tokio::time::timeout(Duration::from_secs(10), progress.wait_for(done))
        .await
        .expect("materializer did not make progress")
        .expect("materializer dropped")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unguarded_counter_loses_an_update() {
    let records = InMemoryStateStore::new("occurrences");
    let store = InterleavingStore::new(records.clone(), 2);
    let materializer = Materializer::new(
        OccurrenceCounter::unguarded(),
        store,
        MaterializerConfig::new("names", "counters")
            .with_dispatch(Dispatch::Concurrent { max_in_flight: 2 }),
    )
    .unwrap();

    let first = name_event(0, "alice");
    let second = name_event(1, "alice");
    let (a, b) = tokio::join!(materializer.process(&first), materializer.process(&second));
    a.unwrap();
    b.unwrap();

    // Two events, but both writers read the same absent prior.
    assert_eq!(count_of(&records, "alice").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn optimistic_counter_survives_interleaving() {
    const WRITERS: u64 = 8;

    let records = InMemoryStateStore::new("occurrences");
    let store = InterleavingStore::new(records.clone(), WRITERS as usize);
    let materializer = Materializer::new(
        OccurrenceCounter::optimistic(),
        store,
        MaterializerConfig::new("names", "counters")
            .with_dispatch(Dispatch::Concurrent { max_in_flight: 8 }),
    )
    .unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for offset in 0..WRITERS {
        let materializer = materializer.clone();
        tasks.spawn(async move { materializer.process(&name_event(offset, "alice")).await });
    }
    while let Some(joined) = tasks.join_next().await {
        assert!(matches!(joined.unwrap().unwrap(), Outcome::Applied(_)));
    }

    assert_eq!(count_of(&records, "alice").await, WRITERS);
    assert_eq!(
        records.version_of("alice").await.unwrap(),
        Some(Version::from(WRITERS))
    );
}

#[tokio::test]
async fn optimistic_counter_gives_up_after_max_conflicts() {
    let records = InMemoryStateStore::new("occurrences");
    let store = InterleavingStore::new(records.clone(), 2);
    let materializer = Materializer::new(
        OccurrenceCounter::new(ConcurrencyControl::Optimistic { max_conflicts: 0 }),
        store,
        MaterializerConfig::new("names", "counters"),
    )
    .unwrap();

    let first = name_event(0, "alice");
    let second = name_event(1, "alice");
    let (a, b) = tokio::join!(materializer.process(&first), materializer.process(&second));

    let failures: Vec<_> = [a, b].into_iter().filter_map(Result::err).collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0],
        MaterializeError::ConflictRetriesExhausted { attempts: 1, .. }
    ));
    assert_eq!(count_of(&records, "alice").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn optimistic_counter_counts_every_event_from_the_bus() {
    let bus = InMemoryMessageBus::new();
    let store = InMemoryStateStore::new("occurrences");
    store.set_latency(Some(Duration::from_millis(1)));

    for _ in 0..20 {
        bus.publish_json("names", "alice", &json!({"name": "alice"}))
            .await
            .unwrap();
    }

    // Every in-flight handler contends for the same key.
    let counter = OccurrenceCounter::new(ConcurrencyControl::Optimistic { max_conflicts: 100 });
    let materializer = Materializer::new(
        counter,
        store.clone(),
        MaterializerConfig::new("names", "counters")
            .with_dispatch(Dispatch::Concurrent { max_in_flight: 4 }),
    )
    .unwrap();
    let handle = materializer.start(&bus).await.unwrap();

    let mut progress = handle.progress();
    let done = wait_until(&mut progress, |p| p.handled >= 20).await;
    assert_eq!(done.applied, 20);

    handle.shutdown().await.unwrap();
    assert_eq!(count_of(&store, "alice").await, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_writer_with_key_affinity_counts_every_event() {
    let bus = InMemoryMessageBus::new();
    let store = InMemoryStateStore::new("occurrences");
    store.set_latency(Some(Duration::from_millis(1)));

    let names = ["alice", "bob", "carol"];
    for round in 0..10 {
        for name in &names[..=(round % 3)] {
            bus.publish("names", name, format!("\"{name}\"").into_bytes())
                .await
                .unwrap();
        }
    }

    let materializer = Materializer::new(
        OccurrenceCounter::single_writer(),
        store.clone(),
        MaterializerConfig::new("names", "counters")
            .with_dispatch(Dispatch::KeyAffinity { workers: 4 }),
    )
    .unwrap();
    let handle = materializer.start(&bus).await.unwrap();

    let mut progress = handle.progress();
    wait_until(&mut progress, |p| p.handled >= 19).await;
    handle.shutdown().await.unwrap();

    assert_eq!(count_of(&store, "alice").await, 10);
    assert_eq!(count_of(&store, "bob").await, 6);
    assert_eq!(count_of(&store, "carol").await, 3);
}

#[tokio::test]
async fn single_writer_rejects_concurrent_dispatch() {
    let result = Materializer::new(
        OccurrenceCounter::single_writer(),
        InMemoryStateStore::new("occurrences"),
        MaterializerConfig::new("names", "counters")
            .with_dispatch(Dispatch::Concurrent { max_in_flight: 4 }),
    );
    assert!(matches!(result, Err(MaterializeError::Configuration(_))));
}

#[tokio::test]
async fn mandate_replay_writes_the_same_content() {
    let store = InMemoryStateStore::new("statestore");
    let materializer = Materializer::new(
        ConnectionMandatesView::new(),
        store.clone(),
        MaterializerConfig::new("connection-mandates-topic", "iot").with_dedupe_window(0),
    )
    .unwrap();

    let mut event = Event {
        message_id: MessageId::new(),
        topic: "connection-mandates-topic".to_string(),
        key: "c1".to_string(),
        payload: serde_json::to_vec(&json!({"connectionId": "c1", "region": "eu"})).unwrap(),
        publish_time: Utc::now(),
        delivery_token: DeliveryToken::new(0, 0),
    };
    materializer.process(&event).await.unwrap();
    let first = store.get("c1").await.unwrap().unwrap();

    event.delivery_token = DeliveryToken::new(0, 1);
    materializer.process(&event).await.unwrap();
    let second = store.get("c1").await.unwrap().unwrap();

    assert_eq!(first.value, second.value);
    assert_eq!(second.value, json!({"connectionId": "c1", "region": "eu"}));
}

#[tokio::test]
async fn poison_message_does_not_stop_later_events() {
    let bus = InMemoryMessageBus::with_partitions(1);
    let store = InMemoryStateStore::new("statestore");

    bus.publish("connection-mandates-topic", "c0", b"{broken".to_vec())
        .await
        .unwrap();
    bus.publish_json(
        "connection-mandates-topic",
        "c1",
        &json!({"connectionId": "c1", "region": "eu"}),
    )
    .await
    .unwrap();

    let materializer = Materializer::new(
        ConnectionMandatesView::new(),
        store.clone(),
        MaterializerConfig::new("connection-mandates-topic", "iot"),
    )
    .unwrap();
    let handle = materializer.start(&bus).await.unwrap();

    let mut progress = handle.progress();
    let done = wait_until(&mut progress, |p| p.handled >= 2).await;
    assert_eq!(done.poison, 1);
    assert_eq!(done.applied, 1);
    assert_eq!(handle.state(), MaterializerState::Active);

    handle.shutdown().await.unwrap();
    assert_eq!(materializer.state(), MaterializerState::Stopped);
    assert!(store.get("c1").await.unwrap().is_some());
    // Both deliveries were acknowledged.
    assert_eq!(
        bus.committed_offset("connection-mandates-topic", "iot", 0),
        Some(2)
    );
}

#[tokio::test]
async fn fail_fast_leaves_the_event_for_the_next_consumer() {
    let bus = InMemoryMessageBus::new();
    let store = InMemoryStateStore::new("occurrences");
    store.set_available(false);

    bus.publish_json("names", "alice", &json!({"name": "alice"}))
        .await
        .unwrap();
    let partition = partition_for("alice", bus.partitions());

    let config = MaterializerConfig::new("names", "counters")
        .with_retry(fast_retry())
        .with_fail_fast(true);
    let first = Materializer::new(OccurrenceCounter::optimistic(), store.clone(), config.clone())
        .unwrap();
    let handle = first.start(&bus).await.unwrap();

    let error = handle.join().await.unwrap_err();
    assert!(matches!(
        error,
        MaterializeError::StoreRetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(first.state(), MaterializerState::Faulted);
    assert_eq!(bus.committed_offset("names", "counters", partition), Some(0));
    assert_eq!(bus.member_count("names", "counters"), 0);

    store.set_available(true);
    let second = Materializer::new(OccurrenceCounter::optimistic(), store.clone(), config).unwrap();
    let handle = second.start(&bus).await.unwrap();

    let mut progress = handle.progress();
    wait_until(&mut progress, |p| p.applied >= 1).await;
    handle.shutdown().await.unwrap();

    assert_eq!(count_of(&store, "alice").await, 1);
    assert_eq!(bus.committed_offset("names", "counters", partition), Some(1));
}

#[tokio::test]
async fn exhausted_retries_drop_the_event_without_fail_fast() {
    let bus = InMemoryMessageBus::with_partitions(1);
    let store = InMemoryStateStore::new("occurrences");
    store.set_available(false);

    bus.publish("names", "alice", b"\"alice\"".to_vec()).await.unwrap();

    let materializer = Materializer::new(
        OccurrenceCounter::optimistic(),
        store.clone(),
        MaterializerConfig::new("names", "counters").with_retry(fast_retry()),
    )
    .unwrap();
    let handle = materializer.start(&bus).await.unwrap();

    let mut progress = handle.progress();
    let done = wait_until(&mut progress, |p| p.handled >= 1).await;
    assert_eq!(done.failed, 1);

    store.set_available(true);
    bus.publish("names", "alice", b"\"alice\"".to_vec()).await.unwrap();
    wait_until(&mut progress, |p| p.applied >= 1).await;

    handle.shutdown().await.unwrap();
    assert_eq!(count_of(&store, "alice").await, 1);
    assert_eq!(bus.committed_offset("names", "counters", 0), Some(2));
}

#[tokio::test]
async fn independent_groups_each_build_their_view() {
    let bus = InMemoryMessageBus::new();
    let blue = InMemoryStateStore::new("blue");
    let red = InMemoryStateStore::new("red");

    for _ in 0..5 {
        bus.publish("names", "alice", b"\"alice\"".to_vec()).await.unwrap();
    }

    let blue_handle = Materializer::new(
        OccurrenceCounter::optimistic(),
        blue.clone(),
        MaterializerConfig::new("names", "blueTeam"),
    )
    .unwrap()
    .start(&bus)
    .await
    .unwrap();
    let red_handle = Materializer::new(
        OccurrenceCounter::optimistic(),
        red.clone(),
        MaterializerConfig::new("names", "redTeam"),
    )
    .unwrap()
    .start(&bus)
    .await
    .unwrap();

    let mut blue_progress = blue_handle.progress();
    let mut red_progress = red_handle.progress();
    wait_until(&mut blue_progress, |p| p.applied >= 5).await;
    wait_until(&mut red_progress, |p| p.applied >= 5).await;

    blue_handle.shutdown().await.unwrap();
    red_handle.shutdown().await.unwrap();
    assert_eq!(count_of(&blue, "alice").await, 5);
    assert_eq!(count_of(&red, "alice").await, 5);
}

#[tokio::test]
async fn subscribe_failure_faults_the_materializer() {
    let bus = InMemoryMessageBus::new();
    bus.set_available(false);

    let materializer = Materializer::new(
        ConnectionMandatesView::new(),
        InMemoryStateStore::new("statestore"),
        MaterializerConfig::new("connection-mandates-topic", "iot").with_retry(fast_retry()),
    )
    .unwrap();

    let result = materializer.start(&bus).await;
    assert!(matches!(result, Err(MaterializeError::Bus(_))));
    assert_eq!(materializer.state(), MaterializerState::Faulted);
}

#[tokio::test]
async fn legacy_integer_counter_is_continued() {
    let store = InMemoryStateStore::new("occurrences");
    store
        .save("alice", json!(3), SaveOptions::new())
        .await
        .unwrap();

    let materializer = Materializer::new(
        OccurrenceCounter::optimistic(),
        store.clone(),
        MaterializerConfig::new("names", "counters"),
    )
    .unwrap();
    materializer.process(&name_event(0, "alice")).await.unwrap();

    assert_eq!(
        store.get("alice").await.unwrap().unwrap().value,
        json!({"key": "alice", "count": 4})
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn copy_of_an_in_flight_event_is_not_acknowledged() {
    let bus = InMemoryMessageBus::with_partitions(1);
    let records = InMemoryStateStore::new("occurrences");
    records.set_available(false);
    let store = GatedStore::new(records.clone());

    bus.publish_json("names", "alice", &json!({"name": "alice"}))
        .await
        .unwrap();

    let materializer = Materializer::new(
        OccurrenceCounter::optimistic(),
        store.clone(),
        MaterializerConfig::new("names", "counters")
            .with_dispatch(Dispatch::Concurrent { max_in_flight: 2 })
            .with_retry(fast_retry())
            .with_fail_fast(true),
    )
    .unwrap();
    let handle = materializer.start(&bus).await.unwrap();
    store.parked().await;

    // A second member joins; the rewind hands offset 0 out again while the
    // first copy is still being handled.
    let mut second = bus.subscribe("names", "counters").await.unwrap();
    let mut progress = handle.progress();
    wait_until(&mut progress, |p| p.deferred >= 1).await;
    assert_eq!(bus.committed_offset("names", "counters", 0), Some(0));

    store.open();
    let error = handle.join().await.unwrap_err();
    assert!(matches!(error, MaterializeError::StoreRetriesExhausted { .. }));
    assert_eq!(materializer.state(), MaterializerState::Faulted);

    let done = *materializer.progress().borrow();
    assert_eq!(done.duplicates, 0);
    assert_eq!(done.failed, 1);
    assert_eq!(bus.committed_offset("names", "counters", 0), Some(0));

    // The event is still there for the remaining member.
    let delivery = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .expect("event was not redelivered")
        .unwrap();
    assert_eq!(delivery.event.delivery_token, DeliveryToken::new(0, 0));
}

async fn stop_with_handler_in_flight(counter: OccurrenceCounter, dispatch: Dispatch) {
    let bus = InMemoryMessageBus::with_partitions(1);
    let records = InMemoryStateStore::new("occurrences");
    let store = GatedStore::new(records.clone());

    bus.publish_json("names", "alice", &json!({"name": "alice"}))
        .await
        .unwrap();

    let materializer = Materializer::new(
        counter,
        store.clone(),
        MaterializerConfig::new("names", "counters").with_dispatch(dispatch),
    )
    .unwrap();
    let handle = materializer.start(&bus).await.unwrap();
    store.parked().await;

    handle.stop();
    store.open();
    handle.join().await.unwrap();

    assert_eq!(materializer.state(), MaterializerState::Stopped);
    assert_eq!(count_of(&records, "alice").await, 1);
    assert_eq!(bus.committed_offset("names", "counters", 0), Some(1));
    assert_eq!(bus.member_count("names", "counters"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_lets_a_concurrent_handler_finish() {
    stop_with_handler_in_flight(
        OccurrenceCounter::optimistic(),
        Dispatch::Concurrent { max_in_flight: 2 },
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_lets_a_key_affinity_worker_finish() {
    stop_with_handler_in_flight(
        OccurrenceCounter::single_writer(),
        Dispatch::KeyAffinity { workers: 2 },
    )
    .await;
}

#[tokio::test(start_paused = true)]
async fn stop_is_observed_while_a_worker_queue_is_full() {
    let bus = InMemoryMessageBus::with_partitions(1);
    let records = InMemoryStateStore::new("occurrences");
    let store = GatedStore::new(records.clone());

    for _ in 0..70 {
        bus.publish("names", "alice", b"\"alice\"".to_vec()).await.unwrap();
    }

    let materializer = Materializer::new(
        OccurrenceCounter::single_writer(),
        store.clone(),
        MaterializerConfig::new("names", "counters")
            .with_dispatch(Dispatch::KeyAffinity { workers: 1 }),
    )
    .unwrap();
    let handle = materializer.start(&bus).await.unwrap();
    store.parked().await;

    // Let the router fill the worker queue and block on the next send.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop();
    tokio::task::yield_now().await;
    store.open();
    handle.join().await.unwrap();

    // The parked event plus a full queue of 64; the blocked one was left.
    assert_eq!(count_of(&records, "alice").await, 65);
    assert_eq!(bus.committed_offset("names", "counters", 0), Some(65));
    assert_eq!(materializer.state(), MaterializerState::Stopped);
}
