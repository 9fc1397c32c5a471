use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery offset of one consumer group on one channel.
///
/// `id` is the human-readable `"<runner>::<channel>"` label and is never used
/// to look a runner up: both names may contain `::`. The store keys rows by
/// `channel_id` and `name` instead.
///
/// `last_processed_id` is the store sequence of the newest message that was
/// handed to every subscriber without error. It only ever moves forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    pub id: String,
    pub name: String,
    pub channel_id: u64,
    pub last_processed_id: Option<u64>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl Runner {
    pub fn new(name: &str, channel: &str, channel_id: u64) -> Self {
        Self {
            id: Self::label(name, channel),
            name: name.to_string(),
            channel_id,
            last_processed_id: None,
            last_processed_at: None,
        }
    }

    /// Display label for a runner/channel pair: `"<runner>::<channel>"`.
    pub fn label(runner: &str, channel: &str) -> String {
        format!("{runner}::{channel}")
    }

    /// Moves the offset to `sequence`. Ignored (returns `false`) unless it is
    /// past the current offset.
    pub fn advance(&mut self, sequence: u64, at: DateTime<Utc>) -> bool {
        if self.last_processed_id.is_some_and(|current| sequence <= current) {
            return false;
        }
        self.last_processed_id = Some(sequence);
        self.last_processed_at = Some(at);
        true
    }
}
