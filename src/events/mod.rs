//! Blog mutation event envelopes.
//!
//! An envelope is the unit the relay publishes to the broker and hands,
//! verbatim, to every connected client:
//!
//! ```json
//! {"id":"6f1c…","type":"CREATED","payload":{"id":"42","blogName":"Hello"}}
//! ```

mod publisher;

pub use publisher::EventPublisher;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::bus::BusError;

/// Kind of blog mutation carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Liked,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "CREATED",
            EventKind::Updated => "UPDATED",
            EventKind::Deleted => "DELETED",
            EventKind::Liked => "LIKED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event envelope: mutation kind plus the serialized entity.
///
/// `id` is assigned by the publisher so clients can recognise a record the
/// broker delivered twice. Envelopes from producers that do not set it still
/// decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: Value,
}

impl EventEnvelope {
    /// New envelope with a fresh identifier.
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            kind,
            payload,
        }
    }

    pub fn created(entity: Value) -> Self {
        Self::new(EventKind::Created, entity)
    }

    pub fn updated(entity: Value) -> Self {
        Self::new(EventKind::Updated, entity)
    }

    pub fn liked(entity: Value) -> Self {
        Self::new(EventKind::Liked, entity)
    }

    /// Deletions carry only the entity identifier.
    pub fn deleted(entity_id: impl Into<String>) -> Self {
        Self::new(EventKind::Deleted, Value::String(entity_id.into()))
    }

    /// Identifier of the mutated entity, used as the broker message key.
    ///
    /// Reads `id` (or a document store's `_id`) from object payloads; a bare
    /// string payload is the identifier itself.
    pub fn entity_id(&self) -> Option<String> {
        match &self.payload {
            Value::String(id) => Some(id.clone()),
            Value::Object(fields) => fields
                .get("id")
                .or_else(|| fields.get("_id"))
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                }),
            _ => None,
        }
    }

    /// Serialize to the wire form.
    pub fn to_json(&self) -> Result<String, BusError> {
        serde_json::to_string(self)
            .map_err(|e| BusError::Publish(format!("Failed to serialize envelope: {}", e)))
    }
}

/// Decode a raw broker payload into the text broadcast to clients.
///
/// The payload must be UTF-8 and parse as an `EventEnvelope`; the original
/// text is returned untouched so clients see exactly what was published.
pub fn decode_payload(payload: Option<&[u8]>) -> Result<String, BusError> {
    let bytes = payload.ok_or_else(|| BusError::Decode("record has no payload".to_string()))?;

    let text = std::str::from_utf8(bytes)
        .map_err(|e| BusError::Decode(format!("payload is not UTF-8: {}", e)))?;

    serde_json::from_str::<EventEnvelope>(text).map_err(|e| BusError::Decode(e.to_string()))?;

    Ok(text.to_string())
}
