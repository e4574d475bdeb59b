//! Core data model.
//!
//! A queue entry is a payload waiting for broker acknowledgement. Entries
//! are kept in insertion order; that order is the delivery order.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Queue entries
// ---------------------------------------------------------------------------

/// Opaque identifier assigned to an entry when it is queued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub String);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A payload waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    /// Serialized payload, published verbatim.
    pub content: String,
}

/// The on-disk document: `{"messages": [{"id": ..., "content": ...}]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueFile {
    #[serde(default)]
    pub messages: Vec<QueueEntry>,
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Where every entry of an engine is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// Broker answer to a single publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack { reason: String },
}

/// Outcome of a drain that emptied the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Entries acknowledged and removed during this drain.
    pub delivered: usize,
}

impl std::fmt::Display for DrainReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.delivered == 0 {
            f.write_str("nothing to send")
        } else {
            write!(f, "delivered {} message(s)", self.delivered)
        }
    }
}

/// Outcome of a successful send: the new entry plus the drain it triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub id: EntryId,
    pub drained: DrainReport,
}
