//! Occurrence counter: how many times each name has been seen.

use message_bus::Event;
use serde::{Deserialize, Serialize};
use state_store::StoredRecord;

use crate::handler::{ConcurrencyControl, UpdateDiscipline, ViewHandler};
use crate::{MaterializeError, Result};

const DEFAULT_MAX_CONFLICTS: u32 = 16;

/// A single sighting of a name.
///
/// Accepts both `{"name": "alice"}` and the bare string `"alice"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NameOccurrence {
    Named { name: String },
    Bare(String),
}

impl NameOccurrence {
    pub fn name(&self) -> &str {
        match self {
            NameOccurrence::Named { name } | NameOccurrence::Bare(name) => name,
        }
    }
}

/// Stored counter record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceCount {
    pub key: String,
    pub count: u64,
}

impl OccurrenceCount {
    /// Reads a stored counter, accepting the legacy bare-integer format.
    pub fn from_value(key: &str, value: &serde_json::Value) -> Option<Self> {
        let count = match value {
            serde_json::Value::Object(fields) => fields.get("count")?.as_u64()?,
            serde_json::Value::Number(n) => n.as_u64()?,
            serde_json::Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        Some(Self {
            key: key.to_string(),
            count,
        })
    }
}

/// Counts occurrence events per name.
///
/// Every event reads the prior count and writes it back incremented, so
/// the counter is only correct under a [`ConcurrencyControl`] that rules out
/// overlapping updates of one key.
#[derive(Debug, Clone, Copy)]
pub struct OccurrenceCounter {
    control: ConcurrencyControl,
}

impl OccurrenceCounter {
    pub fn new(control: ConcurrencyControl) -> Self {
        Self { control }
    }

    /// Conditional writes with re-read on conflict.
    pub fn optimistic() -> Self {
        Self::new(ConcurrencyControl::Optimistic {
            max_conflicts: DEFAULT_MAX_CONFLICTS,
        })
    }

    /// Requires sequential or key-affinity dispatch.
    pub fn single_writer() -> Self {
        Self::new(ConcurrencyControl::SingleWriter)
    }

    /// Loses updates under concurrent dispatch.
    pub fn unguarded() -> Self {
        Self::new(ConcurrencyControl::Unguarded)
    }

    pub fn control(&self) -> ConcurrencyControl {
        self.control
    }
}

impl Default for OccurrenceCounter {
    fn default() -> Self {
        Self::optimistic()
    }
}

impl ViewHandler for OccurrenceCounter {
    type Message = NameOccurrence;

    fn name(&self) -> &'static str {
        "occurrences"
    }

    fn discipline(&self) -> UpdateDiscipline {
        UpdateDiscipline::ReadModifyWrite(self.control)
    }

    fn validate(&self, occurrence: &NameOccurrence) -> std::result::Result<(), String> {
        if occurrence.name().trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        Ok(())
    }

    fn key(&self, _event: &Event, occurrence: &NameOccurrence) -> String {
        occurrence.name().to_string()
    }

    fn apply(
        &self,
        prior: Option<&StoredRecord>,
        occurrence: &NameOccurrence,
    ) -> Result<serde_json::Value> {
        let key = occurrence.name();
        let count = match prior {
            None => 0,
            Some(record) => OccurrenceCount::from_value(key, &record.value)
                .map(|c| c.count)
                .ok_or_else(|| MaterializeError::InvalidRecord {
                    key: key.to_string(),
                    reason: format!("not a counter: {}", record.value),
                })?,
        };

        let count = count
            .checked_add(1)
            .ok_or_else(|| MaterializeError::InvalidRecord {
                key: key.to_string(),
                reason: "counter is at its maximum".to_string(),
            })?;
        let next = OccurrenceCount {
            key: key.to_string(),
            count,
        };
        serde_json::to_value(next).map_err(|e| MaterializeError::InvalidRecord {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}
