use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use crate::{
    BusError, DeliveryToken, Event, MessageId, Published, Result,
    bus::{Acknowledge, Delivery, DeliverySource, MessageBus, Subscription, partition_for},
};

const DEFAULT_PARTITIONS: u32 = 3;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Offsets of one consumer group on one topic.
#[derive(Debug)]
struct GroupState {
    members: Vec<u64>,
    /// Next offset that has not been committed, per partition.
    committed: Vec<u64>,
    /// Next offset to hand out, per partition.
    cursor: Vec<u64>,
    /// Acknowledged offsets at or past `committed`, per partition.
    acked: Vec<BTreeSet<u64>>,
}

impl GroupState {
    fn new(partitions: usize) -> Self {
        Self {
            members: Vec::new(),
            committed: vec![0; partitions],
            cursor: vec![0; partitions],
            acked: vec![BTreeSet::new(); partitions],
        }
    }

    /// Rewinds every partition to its committed offset.
    fn rebalance(&mut self) {
        self.cursor.clone_from(&self.committed);
    }
}

#[derive(Debug)]
struct TopicLog {
    partitions: Vec<Vec<Event>>,
    groups: HashMap<String, GroupState>,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| Vec::new()).collect(),
            groups: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct BusState {
    topics: HashMap<String, TopicLog>,
    available: bool,
    failing_publishes: u32,
}

struct Inner {
    state: Mutex<BusState>,
    /// Bumped on every publish, acknowledgement change and rebalance.
    changes: watch::Sender<u64>,
    partitions: u32,
    max_message_bytes: usize,
    next_member: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn leave(&self, topic: &str, group: &str, member: u64) {
        {
            let mut state = self.lock();
            if let Some(group_state) = state
                .topics
                .get_mut(topic)
                .and_then(|log| log.groups.get_mut(group))
            {
                group_state.members.retain(|m| *m != member);
                group_state.rebalance();
            }
        }
        tracing::debug!(topic, group, member, "consumer left group");
        self.notify();
    }

    /// Hands out the next event for `member`, round-robin over its partitions.
    fn fetch(&self, topic: &str, group: &str, member: u64, next_partition: &mut u32) -> Option<Event> {
        let mut state = self.lock();
        let log = state.topics.get_mut(topic)?;
        let group_state = log.groups.get_mut(group)?;
        let member_index = group_state.members.iter().position(|m| *m == member)?;
        let member_count = group_state.members.len();

        let partitions = log.partitions.len();
        for step in 0..partitions {
            let partition = (*next_partition as usize + step) % partitions;
            if partition % member_count != member_index {
                continue;
            }
            let cursor = group_state.cursor[partition];
            if let Some(event) = log.partitions[partition].get(cursor as usize) {
                group_state.cursor[partition] = cursor + 1;
                *next_partition = ((partition + 1) % partitions) as u32;
                return Some(event.clone());
            }
        }
        None
    }
}

/// In-memory message bus for tests and single-process deployments.
///
/// Each topic is split into a fixed number of partitions; a key always maps
/// to the same partition. Consumer groups track committed offsets, and any
/// membership change rewinds delivery to the last commit, so unacknowledged
/// events are delivered again.
#[derive(Clone)]
pub struct InMemoryMessageBus {
    inner: Arc<Inner>,
}

impl InMemoryMessageBus {
    /// Creates a bus with the default partition count.
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Creates a bus whose topics have `partitions` partitions.
    pub fn with_partitions(partitions: u32) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BusState {
                    topics: HashMap::new(),
                    available: true,
                    failing_publishes: 0,
                }),
                changes,
                partitions: partitions.max(1),
                max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
                next_member: AtomicU64::new(1),
            }),
        }
    }

    /// Sets the largest payload the bus accepts. Must be called before the
    /// bus is shared.
    pub fn with_max_message_bytes(self, max: usize) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.max_message_bytes = max;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    /// Returns the number of partitions per topic.
    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    /// Makes the bus reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    /// Makes the next `count` publish calls fail with a transient error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.lock().failing_publishes = count;
    }

    /// Returns the number of events stored for a topic.
    pub fn published_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Returns the committed offset of a group on a partition.
    pub fn committed_offset(&self, topic: &str, group: &str, partition: u32) -> Option<u64> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .and_then(|g| g.committed.get(partition as usize).copied())
    }

    /// Returns the number of members currently in a consumer group.
    pub fn member_count(&self, topic: &str, group: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .map(|g| g.members.len())
            .unwrap_or(0)
    }

    fn validate(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let reason = if topic.trim().is_empty() {
            Some("topic name is empty".to_string())
        } else if key.is_empty() {
            Some("partitioning key is empty".to_string())
        } else if payload.len() > self.inner.max_message_bytes {
            Some(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.inner.max_message_bytes
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(BusError::InvalidMessage {
                topic: topic.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<Published> {
        self.validate(topic, key, &payload)?;

        let message_id = MessageId::new();
        let token = {
            let mut state = self.inner.lock();
            if !state.available {
                return Err(BusError::Transient("broker unreachable".to_string()));
            }
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(BusError::Transient("broker unreachable".to_string()));
            }

            let partitions = self.inner.partitions;
            let log = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicLog::new(partitions));
            let partition = partition_for(key, partitions);
            let entries = &mut log.partitions[partition as usize];
            let token = DeliveryToken::new(partition, entries.len() as u64);
            entries.push(Event {
                message_id,
                topic: topic.to_string(),
                key: key.to_string(),
                payload,
                publish_time: Utc::now(),
                delivery_token: token,
            });
            token
        };

        metrics::counter!("bus_messages_published_total").increment(1);
        tracing::debug!(topic, key, %token, %message_id, "published");
        self.inner.notify();
        Ok(Published { message_id, token })
    }

    async fn subscribe(&self, topic: &str, consumer_group: &str) -> Result<Subscription> {
        if topic.trim().is_empty() || consumer_group.trim().is_empty() {
            return Err(BusError::InvalidMessage {
                topic: topic.to_string(),
                reason: "topic and consumer group are required to subscribe".to_string(),
            });
        }

        let member = self.inner.next_member.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.lock();
            if !state.available {
                return Err(BusError::Transient("broker unreachable".to_string()));
            }
            let partitions = self.inner.partitions;
            let log = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicLog::new(partitions));
            let group = log
                .groups
                .entry(consumer_group.to_string())
                .or_insert_with(|| GroupState::new(partitions as usize));
            group.members.push(member);
            group.rebalance();
        }
        tracing::info!(topic, group = consumer_group, member, "consumer joined group");
        self.inner.notify();

        let acker = Arc::new(GroupAcker {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            group: consumer_group.to_string(),
        });
        let source = MemorySource {
            inner: Arc::clone(&self.inner),
            changes: self.inner.changes.subscribe(),
            topic: topic.to_string(),
            group: consumer_group.to_string(),
            member,
            next_partition: 0,
            acker,
        };

        Ok(Subscription::new(topic, consumer_group, Box::new(source)))
    }
}

struct GroupAcker {
    inner: Arc<Inner>,
    topic: String,
    group: String,
}

impl GroupAcker {
    fn with_group<F: FnOnce(&mut GroupState)>(&self, f: F) {
        {
            let mut state = self.inner.lock();
            if let Some(group) = state
                .topics
                .get_mut(&self.topic)
                .and_then(|log| log.groups.get_mut(&self.group))
            {
                f(group);
            }
        }
        self.inner.notify();
    }
}

impl Acknowledge for GroupAcker {
    fn ack(&self, token: DeliveryToken) {
        self.with_group(|group| {
            let p = token.partition as usize;
            if token.offset < group.committed[p] {
                return;
            }
            group.acked[p].insert(token.offset);
            while group.acked[p].remove(&group.committed[p]) {
                group.committed[p] += 1;
            }
        });
    }

    fn nack(&self, token: DeliveryToken) {
        self.with_group(|group| {
            let p = token.partition as usize;
            if token.offset >= group.committed[p] {
                group.acked[p].remove(&token.offset);
                group.cursor[p] = group.cursor[p].min(token.offset);
            }
        });
        tracing::debug!(topic = %self.topic, group = %self.group, %token, "delivery rejected, will redeliver");
    }
}

struct MemorySource {
    inner: Arc<Inner>,
    changes: watch::Receiver<u64>,
    topic: String,
    group: String,
    member: u64,
    next_partition: u32,
    acker: Arc<GroupAcker>,
}

#[async_trait]
impl DeliverySource for MemorySource {
    async fn recv(&mut self) -> Option<Delivery> {
        loop {
            self.changes.borrow_and_update();
            if let Some(event) =
                self.inner
                    .fetch(&self.topic, &self.group, self.member, &mut self.next_partition)
            {
                let acker: Arc<dyn Acknowledge> = self.acker.clone();
                return Some(Delivery::new(event, acker));
            }
            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        self.inner.leave(&self.topic, &self.group, self.member);
    }
}
