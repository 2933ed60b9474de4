//! Message factories: what the publisher sends.

use serde_json::{Value, json};

/// A keyed message ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub key: String,
    pub payload: Value,
}

impl OutgoingMessage {
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// Builds the message for a (1-based) sequence number and enrichment text.
pub trait MessageFactory: Send + Sync {
    fn create(&self, sequence: u64, text: &str) -> OutgoingMessage;
}

impl<F> MessageFactory for F
where
    F: Fn(u64, &str) -> OutgoingMessage + Send + Sync,
{
    fn create(&self, sequence: u64, text: &str) -> OutgoingMessage {
        self(sequence, text)
    }
}

/// Name sightings for the occurrence counter, cycling through `names`.
#[derive(Debug, Clone)]
pub struct NameFactory {
    names: Vec<String>,
}

impl NameFactory {
    pub fn new<I, T>(names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        Self {
            names: if names.is_empty() {
                vec!["World".to_string()]
            } else {
                names
            },
        }
    }
}

impl MessageFactory for NameFactory {
    fn create(&self, sequence: u64, text: &str) -> OutgoingMessage {
        let index = (sequence.saturating_sub(1) % self.names.len() as u64) as usize;
        let name = &self.names[index];
        OutgoingMessage::new(
            name.clone(),
            json!({ "name": name, "greeting": text, "messageNumber": sequence }),
        )
    }
}

/// Connection mandates spread over `connections` connection identifiers.
#[derive(Debug, Clone)]
pub struct MandateFactory {
    connections: u64,
    regions: Vec<String>,
}

impl MandateFactory {
    pub fn new<I, T>(connections: u64, regions: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let regions: Vec<String> = regions.into_iter().map(Into::into).collect();
        Self {
            connections: connections.max(1),
            regions: if regions.is_empty() {
                vec!["eu".to_string()]
            } else {
                regions
            },
        }
    }
}

impl MessageFactory for MandateFactory {
    fn create(&self, sequence: u64, text: &str) -> OutgoingMessage {
        let slot = sequence.saturating_sub(1);
        let connection_id = format!("c{}", slot % self.connections + 1);
        let region = &self.regions[(slot % self.regions.len() as u64) as usize];
        OutgoingMessage::new(
            connection_id.clone(),
            json!({
                "connectionId": connection_id,
                "region": region,
                "greeting": text,
                "messageNumber": sequence,
            }),
        )
    }
}
