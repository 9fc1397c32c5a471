//! Persistence layer backed by `sled`
//!
//! Three trees hold the durable state:
//! - `channels`: channel name -> channel id (u64, big-endian)
//! - `messages`: `channel id ++ sequence` (both big-endian) -> encoded
//!   message. Big-endian keys make a prefix scan return one channel's
//!   messages in sequence order.
//! - `runners`: `channel id ++ runner name` -> JSON `Runner`. The fixed-width
//!   channel prefix keeps pairs distinct whatever characters the names use.
//!
//! Sequences come from `Db::generate_id`, which is monotonic across restarts.
//! Appends are serialized so that key order always equals insertion order;
//! otherwise a reader could advance past a sequence that is still being
//! written.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use sled::{Db, IVec, Tree};
use tracing::{debug, trace};

use crate::broker::Message;
use crate::config::StoreSettings;
use crate::persistence::runner::Runner;
use crate::utils::{BusError, lock};

const CHANNELS_TREE: &str = "channels";
const MESSAGES_TREE: &str = "messages";
const RUNNERS_TREE: &str = "runners";

/// A message row as read back from the store. The payload is decoded on
/// demand so a corrupt row fails the dispatch that reaches it, not the scan.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub channel_id: u64,
    pub sequence: u64,
    payload: IVec,
}

impl StoredMessage {
    pub fn message(&self) -> Result<Message, BusError> {
        Message::decode(&self.payload)
    }
}

/// How much history `Store::prune` keeps for a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Retention {
    pub max_age: Option<TimeDelta>,
    pub max_messages: Option<usize>,
}

impl Retention {
    pub fn from_settings(settings: &StoreSettings) -> Self {
        Self {
            max_age: settings
                .message_ttl_secs
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(TimeDelta::try_seconds),
            max_messages: settings.max_messages_per_channel,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_age.is_none() && self.max_messages.is_none()
    }
}

#[derive(Clone)]
pub struct Store {
    db: Db,
    channels: Tree,
    messages: Tree,
    runners: Tree,
    append: Arc<Mutex<()>>,
}

impl Store {
    /// Open or create the database described by `settings`.
    pub fn open(settings: &StoreSettings) -> Result<Self, BusError> {
        let db = sled::Config::new()
            .path(&settings.path)
            .flush_every_ms(settings.flush_every_ms)
            .open()?;
        debug!(path = %settings.path, "store opened");
        Self::from_db(db)
    }

    /// A throwaway database that is removed when the last handle drops.
    pub fn temporary() -> Result<Self, BusError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, BusError> {
        Ok(Self {
            channels: db.open_tree(CHANNELS_TREE)?,
            messages: db.open_tree(MESSAGES_TREE)?,
            runners: db.open_tree(RUNNERS_TREE)?,
            db,
            append: Arc::new(Mutex::new(())),
        })
    }

    pub fn find_channel(&self, name: &str) -> Result<Option<u64>, BusError> {
        self.channels
            .get(name)?
            .map(|raw| decode_u64(&raw, "channel id"))
            .transpose()
    }

    /// Returns the id of channel `name`, creating the row if needed.
    ///
    /// Creation is a compare-and-swap on the name, so racing first publishes
    /// agree on a single id: the loser simply looks the row up again.
    pub fn channel_id(&self, name: &str) -> Result<u64, BusError> {
        loop {
            if let Some(id) = self.find_channel(name)? {
                return Ok(id);
            }

            let candidate = self.db.generate_id()?;
            let created = self.channels.compare_and_swap(
                name,
                None::<&[u8]>,
                Some(&candidate.to_be_bytes()[..]),
            )?;
            match created {
                Ok(()) => {
                    debug!(channel = name, channel_id = candidate, "channel row created");
                    return Ok(candidate);
                }
                Err(_) => trace!(channel = name, "lost channel creation race, retrying lookup"),
            }
        }
    }

    /// Durable channel names, in key order.
    pub fn channel_names(&self) -> Result<Vec<String>, BusError> {
        self.channels
            .iter()
            .keys()
            .map(|key| -> Result<String, BusError> {
                let key = key?;
                String::from_utf8(key.to_vec())
                    .map_err(|_| BusError::CorruptRecord("channel name is not UTF-8".to_string()))
            })
            .collect()
    }

    /// Stores `message` at the end of the channel and returns its sequence.
    pub fn append(&self, channel_id: u64, message: &Message) -> Result<u64, BusError> {
        let encoded = message.encode()?;

        let _ordered = lock(&self.append);
        let sequence = self.db.generate_id()?;
        self.messages
            .insert(message_key(channel_id, sequence), encoded)?;
        trace!(channel_id, sequence, message_id = %message.id(), "message stored");
        Ok(sequence)
    }

    /// Messages of `channel_id` with a sequence strictly greater than
    /// `after` (all of them for `None`), oldest first.
    pub fn messages_after(
        &self,
        channel_id: u64,
        after: Option<u64>,
    ) -> impl Iterator<Item = Result<StoredMessage, BusError>> + '_ {
        let start = after.map_or(0, |sequence| sequence.saturating_add(1));
        self.messages
            .range(message_key(channel_id, start)..=message_key(channel_id, u64::MAX))
            .map(|entry| -> Result<StoredMessage, BusError> {
                let (key, payload) = entry?;
                let (channel_id, sequence) = split_key(&key)?;
                Ok(StoredMessage {
                    channel_id,
                    sequence,
                    payload,
                })
            })
    }

    pub fn count_after(&self, channel_id: u64, after: Option<u64>) -> Result<usize, BusError> {
        let mut count = 0;
        for entry in self.messages_after(channel_id, after) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn load_runner(&self, channel_id: u64, name: &str) -> Result<Option<Runner>, BusError> {
        match self.runners.get(runner_key(channel_id, name))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn save_runner(&self, runner: &Runner) -> Result<(), BusError> {
        self.runners.insert(
            runner_key(runner.channel_id, &runner.name),
            serde_json::to_vec(runner)?,
        )?;
        Ok(())
    }

    /// Every runner that has dispatched on `channel_id`, by name.
    pub fn runners_for(&self, channel_id: u64) -> Result<Vec<Runner>, BusError> {
        let mut runners = Vec::new();
        for entry in self.runners.scan_prefix(channel_id.to_be_bytes()).values() {
            let runner: Runner = serde_json::from_slice(&entry?)?;
            if runner.channel_id != channel_id {
                return Err(BusError::CorruptRecord(format!(
                    "runner `{}` stored under channel {channel_id} belongs to channel {}",
                    runner.id, runner.channel_id
                )));
            }
            runners.push(runner);
        }
        Ok(runners)
    }

    /// Deletes the oldest messages of `channel_id` that fall outside
    /// `retention`, measured against `now`. Returns how many were removed.
    ///
    /// Runner offsets are left alone: a runner that had not reached a pruned
    /// message just resumes at the next surviving one.
    pub fn prune(
        &self,
        channel_id: u64,
        retention: &Retention,
        now: DateTime<Utc>,
    ) -> Result<usize, BusError> {
        if retention.is_unbounded() {
            return Ok(0);
        }

        let stored: Vec<StoredMessage> = self
            .messages_after(channel_id, None)
            .collect::<Result<_, _>>()?;
        let excess = retention
            .max_messages
            .map_or(0, |max| stored.len().saturating_sub(max));

        let mut removed = 0;
        for (index, row) in stored.iter().enumerate() {
            let expired = match retention.max_age {
                Some(max_age) => now - row.message()?.created_at() > max_age,
                None => false,
            };
            if index < excess || expired {
                self.messages
                    .remove(message_key(channel_id, row.sequence))?;
                removed += 1;
            }
        }

        debug!(channel_id, removed, "retention applied");
        Ok(removed)
    }

    pub fn flush(&self) -> Result<(), BusError> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db", &"sled::Db")
            .field("channels", &self.channels.len())
            .field("messages", &self.messages.len())
            .field("runners", &self.runners.len())
            .finish()
    }
}

fn message_key(channel_id: u64, sequence: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&channel_id.to_be_bytes());
    key[8..].copy_from_slice(&sequence.to_be_bytes());
    key
}

fn runner_key(channel_id: u64, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + name.len());
    key.extend_from_slice(&channel_id.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

fn split_key(key: &[u8]) -> Result<(u64, u64), BusError> {
    if key.len() != 16 {
        return Err(BusError::CorruptRecord(format!(
            "message key has {} bytes, expected 16",
            key.len()
        )));
    }
    Ok((
        decode_u64(&key[..8], "channel id")?,
        decode_u64(&key[8..], "sequence")?,
    ))
}

fn decode_u64(raw: &[u8], what: &str) -> Result<u64, BusError> {
    <[u8; 8]>::try_from(raw)
        .map(u64::from_be_bytes)
        .map_err(|_| BusError::CorruptRecord(format!("{what} is not 8 bytes")))
}
