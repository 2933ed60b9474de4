//! Connection mandates: the latest mandate per connection identifier.

use message_bus::Event;
use serde::{Deserialize, Serialize};
use state_store::StoredRecord;

use crate::handler::{UpdateDiscipline, ViewHandler};
use crate::{MaterializeError, Result};

/// Mandate settings for one connection.
///
/// Only `connectionId` is required; every other field is kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMandate {
    #[serde(rename = "connectionId")]
    pub connection_id: String,

    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Keeps the most recent mandate for each connection.
///
/// The stored value is the mandate payload itself, so replaying an event
/// writes the same content again.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionMandatesView;

impl ConnectionMandatesView {
    pub fn new() -> Self {
        Self
    }
}

impl ViewHandler for ConnectionMandatesView {
    type Message = ConnectionMandate;

    fn name(&self) -> &'static str {
        "connection_mandates"
    }

    fn discipline(&self) -> UpdateDiscipline {
        UpdateDiscipline::Replace
    }

    fn validate(&self, mandate: &ConnectionMandate) -> std::result::Result<(), String> {
        if mandate.connection_id.trim().is_empty() {
            return Err("connectionId must not be empty".to_string());
        }
        Ok(())
    }

    fn key(&self, _event: &Event, mandate: &ConnectionMandate) -> String {
        mandate.connection_id.clone()
    }

    fn apply(
        &self,
        _prior: Option<&StoredRecord>,
        mandate: &ConnectionMandate,
    ) -> Result<serde_json::Value> {
        serde_json::to_value(mandate).map_err(|e| MaterializeError::InvalidRecord {
            key: mandate.connection_id.clone(),
            reason: e.to_string(),
        })
    }
}
