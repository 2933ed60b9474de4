use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Per-key write counter used for conditional writes.
///
/// An absent key is at [`Version::ABSENT`]; every successful save moves the
/// key one step further, starting at [`Version::first`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const ABSENT: Version = Version(0);

    pub const fn first() -> Self {
        Version(1)
    }

    pub const fn successor(self) -> Self {
        Version(self.0 + 1)
    }

    pub const fn is_absent(self) -> bool {
        self.0 == 0
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Quoted entity tag for HTTP responses, e.g. `"3"`.
    pub fn etag(self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for Version {
    fn from(raw: u64) -> Self {
        Version(raw)
    }
}

/// A value held by the state store under a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,

    /// The materialized value as JSON.
    pub value: serde_json::Value,

    /// Changes on every successful write.
    pub version: Version,

    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    /// Deserializes the value into `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.value.clone())
    }
}
