//! View handler trait, update disciplines and progress tracking.

use message_bus::Event;
use serde::de::DeserializeOwned;
use state_store::StoredRecord;

use crate::Result;

/// How concurrent read-modify-write updates to one key are kept safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyControl {
    /// Writes carry the version that was read; a conflict re-reads and
    /// retries, at most `max_conflicts` times.
    Optimistic { max_conflicts: u32 },

    /// Relies on every event of a key being handled by one sequential
    /// worker. Only valid with sequential or key-affinity dispatch.
    SingleWriter,

    /// Plain read-then-write with no protection. Loses updates when two
    /// invocations for the same key overlap.
    Unguarded,
}

/// How a view computes and persists a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDiscipline {
    /// The new value depends on the event alone. No read precedes the write.
    Replace,

    /// The new value depends on the prior value, which is read first.
    ReadModifyWrite(ConcurrencyControl),
}

impl UpdateDiscipline {
    /// Returns true if correctness depends on a single writer per key.
    pub fn requires_single_writer(&self) -> bool {
        matches!(
            self,
            UpdateDiscipline::ReadModifyWrite(ConcurrencyControl::SingleWriter)
        )
    }
}

/// A materialized view: decodes events and folds them into keyed records.
///
/// Handlers are pure; the materializer owns every store interaction, retry
/// and acknowledgement.
pub trait ViewHandler: Send + Sync + 'static {
    /// Schema of the events this view consumes.
    type Message: DeserializeOwned + Send + Sync;

    /// Returns the name of this view.
    fn name(&self) -> &'static str;

    /// Returns how records of this view are updated.
    fn discipline(&self) -> UpdateDiscipline;

    /// Decodes an event payload.
    fn decode(&self, event: &Event) -> std::result::Result<Self::Message, String> {
        event.decode().map_err(|e| e.to_string())
    }

    /// Checks domain rules the schema alone cannot express.
    fn validate(&self, _message: &Self::Message) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Returns the record key the message updates.
    fn key(&self, event: &Event, message: &Self::Message) -> String;

    /// Computes the new record value.
    ///
    /// `prior` is always None for [`UpdateDiscipline::Replace`].
    fn apply(&self, prior: Option<&StoredRecord>, message: &Self::Message)
    -> Result<serde_json::Value>;
}

/// What happened to a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The record was written and now has this version.
    Applied(state_store::Version),
    /// The delivery was applied recently and skipped.
    Duplicate,
    /// The payload was malformed and skipped.
    Poison,
    /// A redelivered copy arrived while this instance was still handling the
    /// original. The copy is left unacknowledged; the original settles it.
    InFlight,
}

/// Counts of events handled by a materializer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Every event that reached a final outcome, including failures.
    pub handled: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub poison: u64,
    pub failed: u64,
    /// Copies set aside while their original was in flight. Not counted in
    /// `handled`.
    pub deferred: u64,
}

impl Progress {
    /// Creates progress at zero.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Records one outcome.
    pub fn record(&mut self, outcome: Option<Outcome>) {
        if outcome == Some(Outcome::InFlight) {
            self.deferred += 1;
            return;
        }
        self.handled += 1;
        match outcome {
            Some(Outcome::Applied(_)) => self.applied += 1,
            Some(Outcome::Duplicate) => self.duplicates += 1,
            Some(Outcome::Poison) => self.poison += 1,
            Some(Outcome::InFlight) => {}
            None => self.failed += 1,
        }
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "handled={} applied={} duplicates={} poison={} failed={} deferred={}",
            self.handled,
            self.applied,
            self.duplicates,
            self.poison,
            self.failed,
            self.deferred
        )
    }
}
