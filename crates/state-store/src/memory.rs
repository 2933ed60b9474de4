use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    Result, StateStoreError, StoredRecord, Version,
    store::{SaveOptions, StateStore},
};

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    failing_operations: u32,
    latency: Option<Duration>,
}

/// In-memory state store for testing and single-process deployments.
///
/// Provides the same conditional-write semantics a real store exposes,
/// plus fault injection to exercise retry and timeout paths.
#[derive(Clone)]
pub struct InMemoryStateStore {
    name: Arc<str>,
    records: Arc<RwLock<HashMap<String, StoredRecord>>>,
    faults: Arc<Mutex<Faults>>,
}

impl InMemoryStateStore {
    /// Creates a new empty store called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            records: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    /// Returns the number of keys stored.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns true if no keys are stored.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Removes every record.
    pub async fn clear(&self) {
        self.records.write().await.clear();
    }

    /// Makes the store reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.faults().unavailable = !available;
    }

    /// Makes the next `count` operations fail with `Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.faults().failing_operations = count;
    }

    /// Delays every operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults().latency = latency;
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn check_reachable(&self) -> Result<()> {
        let latency = self.faults().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self.faults();
        if faults.unavailable {
            return Err(StateStoreError::Unavailable(format!(
                "store '{}' is unreachable",
                self.name
            )));
        }
        if faults.failing_operations > 0 {
            faults.failing_operations -= 1;
            return Err(StateStoreError::Unavailable(format!(
                "store '{}' did not respond",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        self.check_reachable().await?;
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn save(
        &self,
        key: &str,
        value: serde_json::Value,
        options: SaveOptions,
    ) -> Result<Version> {
        self.check_reachable().await?;

        let mut records = self.records.write().await;
        let current = records
            .get(key)
            .map(|record| record.version)
            .unwrap_or(Version::ABSENT);

        if let Some(expected) = options.expected_version
            && current != expected
        {
            return Err(StateStoreError::Conflict {
                key: key.to_string(),
                expected,
                actual: current,
            });
        }

        let version = current.successor();
        records.insert(
            key.to_string(),
            StoredRecord {
                key: key.to_string(),
                value,
                version,
                updated_at: Utc::now(),
            },
        );
        tracing::trace!(store = %self.name, key, %version, "saved");

        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_reachable().await?;
        self.records.write().await.remove(key);
        Ok(())
    }
}
