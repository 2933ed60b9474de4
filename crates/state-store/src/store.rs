use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Result, StoredRecord, Version};

/// Options for saving a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Version the record must currently have for the write to succeed.
    /// If None, the write overwrites unconditionally (last write wins).
    pub expected_version: Option<Version>,
}

impl SaveOptions {
    /// Creates options for an unconditional overwrite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the record to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Creates options expecting the key to be absent.
    pub fn expect_absent() -> Self {
        Self {
            expected_version: Some(Version::ABSENT),
        }
    }
}

/// One entry of a bulk save.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub key: String,
    pub value: serde_json::Value,
    pub options: SaveOptions,
}

impl SaveRequest {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
            options: SaveOptions::new(),
        }
    }

    pub fn with_options(mut self, options: SaveOptions) -> Self {
        self.options = options;
        self
    }
}

/// Core trait for state store clients.
///
/// A store holds a flat key space under its name. Writes are atomic per key
/// only; there are no cross-key transactions. All implementations must be
/// thread-safe (Send + Sync).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the name of this store.
    fn name(&self) -> &str;

    /// Reads the record stored under `key`.
    ///
    /// Returns None if the key was never written or has been deleted.
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>>;

    /// Writes `value` under `key`.
    ///
    /// If `options.expected_version` is set, the write fails with `Conflict`
    /// unless the current version matches. Returns the new version.
    async fn save(&self, key: &str, value: serde_json::Value, options: SaveOptions)
    -> Result<Version>;

    /// Removes `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Extension trait providing convenience methods for state stores.
#[async_trait]
pub trait StateStoreExt: StateStore {
    /// Saves several records in order.
    ///
    /// Not transactional: stops at the first failure, leaving earlier writes
    /// in place.
    async fn save_all(&self, requests: Vec<SaveRequest>) -> Result<Vec<Version>> {
        let mut versions = Vec::with_capacity(requests.len());
        for request in requests {
            versions.push(self.save(&request.key, request.value, request.options).await?);
        }
        Ok(versions)
    }

    /// Reads a record and deserializes its value.
    async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, Version)>> {
        match self.get(key).await? {
            Some(record) => Ok(Some((record.value_as()?, record.version))),
            None => Ok(None),
        }
    }

    /// Serializes `value` and writes it.
    async fn save_as<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        options: SaveOptions,
    ) -> Result<Version> {
        let value = serde_json::to_value(value)?;
        self.save(key, value, options).await
    }

    /// Returns the current version of a key, or None if absent.
    async fn version_of(&self, key: &str) -> Result<Option<Version>> {
        Ok(self.get(key).await?.map(|record| record.version))
    }
}

// Blanket implementation for all StateStore implementations
impl<T: StateStore + ?Sized> StateStoreExt for T {}

#[async_trait]
impl<S: StateStore + ?Sized> StateStore for std::sync::Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        (**self).get(key).await
    }

    async fn save(
        &self,
        key: &str,
        value: serde_json::Value,
        options: SaveOptions,
    ) -> Result<Version> {
        (**self).save(key, value, options).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }
}
