//! Message definitions for the bus
//!
//! `Message` is the unit every service moves around. It carries a
//! generated `id`, a `created_at` timestamp, a `kind` discriminator and an
//! object of named attributes.
//!
//! Notes on fields:
//! - `id`: UUID v4, fixed at construction; equality and hashing use only this
//! - `kind`: names the message subtype, checked when reading a typed payload
//! - `created_at`: UTC, encoded as RFC 3339 with full precision so it
//!   survives an encode/decode cycle unchanged
//! - `attributes`: arbitrary JSON values keyed by name
//!
//! Services queue and store the encoded form (`Message::encode`), and decode
//! it again right before handing it to subscribers.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::utils::BusError;

/// A struct that can travel as the attributes of a [`Message`].
///
/// ```rust
/// use relaybus::broker::{Message, Payload};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced {
///     order_id: u64,
/// }
///
/// impl Payload for OrderPlaced {
///     const KIND: &'static str = "order_placed";
/// }
///
/// let msg = Message::from_payload(&OrderPlaced { order_id: 7 }).unwrap();
/// assert_eq!(msg.kind(), "order_placed");
/// assert_eq!(msg.payload::<OrderPlaced>().unwrap().order_id, 7);
/// ```
pub trait Payload: Serialize + DeserializeOwned {
    const KIND: &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    kind: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    attributes: Map<String, Value>,
}

impl Message {
    pub fn new(kind: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            created_at: Utc::now(),
            attributes,
        }
    }

    /// Builds a message whose attributes are the fields of `payload`.
    pub fn from_payload<P: Payload>(payload: &P) -> Result<Self, BusError> {
        match serde_json::to_value(payload)? {
            Value::Object(attributes) => Ok(Self::new(P::KIND, attributes)),
            _ => Err(BusError::NonObjectPayload {
                kind: P::KIND.to_string(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Reads the attributes back as `P`, refusing messages of another kind.
    pub fn payload<P: Payload>(&self) -> Result<P, BusError> {
        if self.kind != P::KIND {
            return Err(BusError::KindMismatch {
                expected: P::KIND.to_string(),
                found: self.kind.clone(),
            });
        }
        Ok(serde_json::from_value(Value::Object(self.attributes.clone()))?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Message {}

impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
