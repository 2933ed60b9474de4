//! Subscription-driven materializer for a single view.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use message_bus::{BusError, Delivery, Event, MessageBus, Subscription, partition_for};
use state_store::{SaveOptions, StateStore, StateStoreError, StoredRecord, Version};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{Dispatch, MaterializerConfig};
use crate::dedupe::{Claim, DedupeWindow};
use crate::handler::{ConcurrencyControl, Outcome, Progress, UpdateDiscipline, ViewHandler};
use crate::{MaterializeError, Result};

const WORKER_QUEUE_DEPTH: usize = 64;

/// Lifecycle of a materializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializerState {
    Idle,
    Subscribing,
    Active,
    Stopped,
    Faulted,
}

impl std::fmt::Display for MaterializerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MaterializerState::Idle => "idle",
            MaterializerState::Subscribing => "subscribing",
            MaterializerState::Active => "active",
            MaterializerState::Stopped => "stopped",
            MaterializerState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

struct Core<H, S> {
    handler: H,
    store: S,
    config: MaterializerConfig,
    dedupe: Mutex<DedupeWindow>,
    progress: watch::Sender<Progress>,
    state: watch::Sender<MaterializerState>,
}

/// Applies the events of one topic to one view in a state store.
///
/// The materializer owns decoding, the update discipline, store retries and
/// acknowledgement. A delivery is acknowledged only after its write
/// succeeded, or after it was classified as poison and skipped. Clones share
/// the same progress, dedupe window and state.
pub struct Materializer<H, S> {
    core: Arc<Core<H, S>>,
}

impl<H, S> Clone for Materializer<H, S> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<H, S> Materializer<H, S>
where
    H: ViewHandler,
    S: StateStore + 'static,
{
    /// Creates a materializer, rejecting configurations the view's update
    /// discipline cannot run under.
    pub fn new(handler: H, store: S, config: MaterializerConfig) -> Result<Self> {
        config.validate(handler.discipline())?;
        let dedupe = Mutex::new(DedupeWindow::new(config.dedupe_window));
        let (progress, _) = watch::channel(Progress::zero());
        let (state, _) = watch::channel(MaterializerState::Idle);

        Ok(Self {
            core: Arc::new(Core {
                handler,
                store,
                config,
                dedupe,
                progress,
                state,
            }),
        })
    }

    pub fn handler(&self) -> &H {
        &self.core.handler
    }

    pub fn store(&self) -> &S {
        &self.core.store
    }

    pub fn config(&self) -> &MaterializerConfig {
        &self.core.config
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> MaterializerState {
        *self.core.state.borrow()
    }

    /// Watches progress. Tests wait on this instead of sleeping.
    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.core.progress.subscribe()
    }

    /// Applies a single event outside of any subscription.
    ///
    /// Poison payloads and recently applied deliveries resolve to `Ok` with
    /// the matching [`Outcome`].
    pub async fn process(&self, event: &Event) -> Result<Outcome> {
        self.core.handle(event).await
    }

    /// Subscribes to the configured topic and starts consuming.
    ///
    /// Subscribing is retried on transient bus failures.
    pub async fn start<B>(&self, bus: &B) -> Result<MaterializerHandle>
    where
        B: MessageBus + ?Sized,
    {
        let core = &self.core;
        core.set_state(MaterializerState::Subscribing);

        let topic = core.config.topic.as_str();
        let group = core.config.consumer_group.as_str();
        let subscription = core
            .config
            .retry
            .retry(|_| bus.subscribe(topic, group), BusError::is_retryable)
            .await
            .map_err(|failure| {
                core.set_state(MaterializerState::Faulted);
                tracing::error!(
                    view = core.handler.name(),
                    topic,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "subscribe failed"
                );
                MaterializeError::Bus(failure.error)
            })?;

        Ok(self.run(subscription))
    }

    /// Consumes an existing subscription on a background task.
    pub fn run(&self, subscription: Subscription) -> MaterializerHandle {
        let stop = CancellationToken::new();
        let core = Arc::clone(&self.core);
        core.set_state(MaterializerState::Active);
        tracing::info!(
            view = core.handler.name(),
            topic = subscription.topic(),
            group = subscription.consumer_group(),
            dispatch = ?core.config.dispatch,
            "materializer active"
        );

        let token = stop.clone();
        let task = tokio::spawn(async move {
            let result = match core.config.dispatch {
                Dispatch::Sequential => core.run_sequential(subscription, token).await,
                Dispatch::Concurrent { max_in_flight } => {
                    core.run_concurrent(subscription, token, max_in_flight).await
                }
                Dispatch::KeyAffinity { workers } => {
                    core.run_key_affinity(subscription, token, workers).await
                }
            };
            match &result {
                Ok(()) => core.set_state(MaterializerState::Stopped),
                Err(error) => {
                    tracing::error!(view = core.handler.name(), %error, "materializer faulted");
                    core.set_state(MaterializerState::Faulted);
                }
            }
            result
        });

        MaterializerHandle {
            stop,
            task,
            state: self.core.state.subscribe(),
            progress: self.core.progress.subscribe(),
        }
    }
}

impl<H, S> Core<H, S>
where
    H: ViewHandler,
    S: StateStore + 'static,
{
    fn set_state(&self, state: MaterializerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(view = self.handler.name(), from = %previous, to = %state, "state changed");
        }
    }

    fn dedupe(&self) -> std::sync::MutexGuard<'_, DedupeWindow> {
        self.dedupe.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[tracing::instrument(
        name = "materialize",
        skip_all,
        fields(
            view = self.handler.name(),
            topic = %event.topic,
            key = %event.key,
            token = %event.delivery_token,
            message_id = %event.message_id,
        )
    )]
    async fn handle(&self, event: &Event) -> Result<Outcome> {
        let token = event.delivery_token;
        let claim = self.dedupe().claim(token);
        let result = match claim {
            Claim::Claimed => {
                let result = self.materialize(event).await;
                self.dedupe()
                    .release(token, matches!(result, Ok(Outcome::Applied(_))));
                result
            }
            Claim::Applied => {
                tracing::debug!("skipping redelivered event");
                Ok(Outcome::Duplicate)
            }
            Claim::InFlight => {
                tracing::debug!("original delivery still in flight, leaving copy unacknowledged");
                Ok(Outcome::InFlight)
            }
        };
        self.record(&result);
        result
    }

    fn record(&self, result: &Result<Outcome>) {
        let outcome = result.as_ref().ok().copied();
        let label = match outcome {
            Some(Outcome::Applied(_)) => "applied",
            Some(Outcome::Duplicate) => "duplicate",
            Some(Outcome::Poison) => "poison",
            Some(Outcome::InFlight) => "deferred",
            None => "failed",
        };
        metrics::counter!(
            "materializer_events_total",
            "view" => self.handler.name(),
            "outcome" => label
        )
        .increment(1);
        self.progress.send_modify(|progress| progress.record(outcome));
    }

    async fn materialize(&self, event: &Event) -> Result<Outcome> {
        let message = match self
            .handler
            .decode(event)
            .and_then(|message| self.handler.validate(&message).map(|()| message))
        {
            Ok(message) => message,
            Err(reason) => {
                let error = MaterializeError::InvalidMessage {
                    topic: event.topic.clone(),
                    token: event.delivery_token,
                    reason,
                };
                tracing::warn!(%error, payload = %event.payload_text(), "skipping poison message");
                return Ok(Outcome::Poison);
            }
        };

        let key = self.handler.key(event, &message);
        let version = match self.handler.discipline() {
            UpdateDiscipline::Replace => self.replace(&key, &message).await?,
            UpdateDiscipline::ReadModifyWrite(ConcurrencyControl::Optimistic { max_conflicts }) => {
                self.optimistic_update(&key, &message, max_conflicts).await?
            }
            UpdateDiscipline::ReadModifyWrite(
                ConcurrencyControl::SingleWriter | ConcurrencyControl::Unguarded,
            ) => self.read_then_write(&key, &message).await?,
        };

        tracing::debug!(record_key = %key, %version, "materialized");
        Ok(Outcome::Applied(version))
    }

    async fn replace(&self, key: &str, message: &H::Message) -> Result<Version> {
        let value = self.handler.apply(None, message)?;
        self.with_store_retry(key, |_| {
            self.store.save(key, value.clone(), SaveOptions::new())
        })
        .await
    }

    async fn read_then_write(&self, key: &str, message: &H::Message) -> Result<Version> {
        let prior = self.read(key).await?;
        let value = self.handler.apply(prior.as_ref(), message)?;
        self.with_store_retry(key, |_| {
            self.store.save(key, value.clone(), SaveOptions::new())
        })
        .await
    }

    async fn optimistic_update(
        &self,
        key: &str,
        message: &H::Message,
        max_conflicts: u32,
    ) -> Result<Version> {
        let mut conflicts = 0;
        loop {
            let prior = self.read(key).await?;
            let expected = prior
                .as_ref()
                .map_or(Version::ABSENT, |record| record.version);
            let value = self.handler.apply(prior.as_ref(), message)?;
            let options = SaveOptions::expect_version(expected);

            match self
                .with_store_retry(key, |_| self.store.save(key, value.clone(), options))
                .await
            {
                Err(MaterializeError::Store(StateStoreError::Conflict { actual, .. })) => {
                    conflicts += 1;
                    metrics::counter!("materializer_conflicts_total", "view" => self.handler.name())
                        .increment(1);
                    if conflicts > max_conflicts {
                        return Err(MaterializeError::ConflictRetriesExhausted {
                            key: key.to_string(),
                            attempts: conflicts,
                        });
                    }
                    tracing::debug!(
                        record_key = key,
                        %expected,
                        %actual,
                        conflicts,
                        "write conflict, re-reading"
                    );
                }
                other => return other,
            }
        }
    }

    async fn read(&self, key: &str) -> Result<Option<StoredRecord>> {
        self.with_store_retry(key, |_| self.store.get(key)).await
    }

    async fn with_store_retry<T, F, Fut>(&self, key: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = state_store::Result<T>>,
    {
        let view = self.handler.name();
        self.config
            .retry
            .retry(
                |attempt| {
                    if attempt > 1 {
                        metrics::counter!("materializer_store_retries_total", "view" => view)
                            .increment(1);
                    }
                    op(attempt)
                },
                StateStoreError::is_transient,
            )
            .await
            .map_err(|failure| {
                if failure.error.is_transient() {
                    MaterializeError::StoreRetriesExhausted {
                        key: key.to_string(),
                        attempts: failure.attempts,
                        source: failure.error,
                    }
                } else {
                    MaterializeError::Store(failure.error)
                }
            })
    }

    async fn handle_delivery(&self, delivery: Delivery) -> Result<()> {
        let (event, ack) = delivery.into_parts();
        match self.handle(&event).await {
            // The original's ack or fault settles the offset.
            Ok(Outcome::InFlight) => Ok(()),
            Ok(_) => {
                ack.ack();
                Ok(())
            }
            Err(error) if self.config.fail_fast => {
                tracing::error!(
                    view = self.handler.name(),
                    token = %event.delivery_token,
                    %error,
                    "leaving event unacknowledged"
                );
                Err(error)
            }
            Err(error) => {
                tracing::error!(
                    view = self.handler.name(),
                    token = %event.delivery_token,
                    %error,
                    "dropping event"
                );
                ack.ack();
                Ok(())
            }
        }
    }

    async fn run_sequential(
        &self,
        mut subscription: Subscription,
        stop: CancellationToken,
    ) -> Result<()> {
        let result = loop {
            let delivery = tokio::select! {
                biased;
                () = stop.cancelled() => break Ok(()),
                delivery = subscription.next() => delivery,
            };
            let Some(delivery) = delivery else {
                break Ok(());
            };
            if let Err(error) = self.handle_delivery(delivery).await {
                break Err(error);
            }
        };
        subscription.unsubscribe();
        result
    }

    async fn run_concurrent(
        self: &Arc<Self>,
        mut subscription: Subscription,
        stop: CancellationToken,
        max_in_flight: usize,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        let mut failure = None;

        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(error) = task_result(joined) {
                        failure = Some(error);
                        break;
                    }
                }
                delivery = subscription.next(), if tasks.len() < max_in_flight => {
                    let Some(delivery) = delivery else { break };
                    let core = Arc::clone(self);
                    tasks.spawn(async move { core.handle_delivery(delivery).await });
                }
            }
        }

        // Drain in-flight handlers before leaving the group.
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = task_result(joined) {
                failure.get_or_insert(error);
            }
        }
        subscription.unsubscribe();
        failure.map_or(Ok(()), Err)
    }

    async fn run_key_affinity(
        self: &Arc<Self>,
        mut subscription: Subscription,
        stop: CancellationToken,
        workers: usize,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        let mut queues = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, mut rx) = mpsc::channel::<Delivery>(WORKER_QUEUE_DEPTH);
            let core = Arc::clone(self);
            tasks.spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    core.handle_delivery(delivery).await?;
                }
                Ok(())
            });
            queues.push(tx);
        }

        let mut failure = None;
        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                Some(joined) = tasks.join_next() => {
                    // Workers only finish early on a fault.
                    if let Err(error) = task_result(joined) {
                        failure = Some(error);
                    }
                    break;
                }
                delivery = subscription.next() => {
                    let Some(delivery) = delivery else { break };
                    let slot = self.worker_for(&delivery.event, workers);
                    // A full queue must not hold up a stop; an unsent delivery
                    // stays unacknowledged.
                    let sent = tokio::select! {
                        biased;
                        () = stop.cancelled() => break,
                        sent = queues[slot].send(delivery) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        drop(queues);
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = task_result(joined) {
                failure.get_or_insert(error);
            }
        }
        subscription.unsubscribe();
        failure.map_or(Ok(()), Err)
    }

    /// Routes by the record key the view will write, falling back to the
    /// bus key for payloads that do not decode.
    fn worker_for(&self, event: &Event, workers: usize) -> usize {
        let key = match self.handler.decode(event) {
            Ok(message) => self.handler.key(event, &message),
            Err(_) => event.key.clone(),
        };
        partition_for(&key, workers as u32) as usize
    }
}

fn task_result(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.map_err(|e| MaterializeError::Task(e.to_string()))?
}

/// Handle to a running materializer.
pub struct MaterializerHandle {
    stop: CancellationToken,
    task: JoinHandle<Result<()>>,
    state: watch::Receiver<MaterializerState>,
    progress: watch::Receiver<Progress>,
}

impl MaterializerHandle {
    /// Asks the materializer to stop after in-flight events finish.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Waits for the materializer to stop.
    ///
    /// Returns the error that faulted it, if any.
    pub async fn join(self) -> Result<()> {
        task_result(self.task.await)
    }

    /// Stops the materializer and waits for it.
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.join().await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn state(&self) -> MaterializerState {
        *self.state.borrow()
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }
}
