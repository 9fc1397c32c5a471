//! The `error` module defines the error type shared by every bus service.
//!
//! Producer-facing failures (encoding, storage, a closed service) come back
//! from `publish`; consumer-facing failures (a subscriber returning an error)
//! come back from `dispatch`.

use thiserror::Error;
use uuid::Uuid;

/// Error returned by a subscriber callback.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum BusError {
    /// A message could not be encoded or decoded.
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A typed payload serialized to something other than a JSON object.
    #[error("payload for `{kind}` must serialize to a JSON object")]
    NonObjectPayload { kind: String },

    #[error("message is of kind `{found}`, expected `{expected}`")]
    KindMismatch { expected: String, found: String },

    /// A subscriber callback failed while a message was being dispatched.
    #[error("subscriber on channel `{channel}` failed for message {message_id}: {source}")]
    Subscriber {
        channel: String,
        message_id: Uuid,
        #[source]
        source: HandlerError,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// Publish attempted on a threaded service after shutdown.
    #[error("service is shut down, cannot publish to `{channel}`")]
    ServiceClosed { channel: String },

    #[error("failed to spawn channel worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

impl BusError {
    /// True when the error came from a subscriber rather than the bus itself.
    pub fn is_subscriber_failure(&self) -> bool {
        matches!(self, BusError::Subscriber { .. })
    }
}
