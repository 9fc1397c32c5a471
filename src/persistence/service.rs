//! Durable bus service
//!
//! Messages and runner offsets live in the sled `Store`; subscribers are
//! in-memory only, exactly like the other services.
//!
//! Delivery is tracked per runner: `dispatch(runner, ..)` walks the messages
//! after that runner's offset and moves the offset forward one message at a
//! time, only once every subscriber accepted the message. A failing
//! subscriber stops the call and leaves the offset on the last fully
//! delivered message, so the next call retries the failed one
//! (at-least-once).
//!
//! Dispatches for the same runner and channel are serialized by an
//! in-process lock; different runners, or different channels, proceed
//! independently. sled holds an exclusive lock on its directory, so
//! in-process serialization covers every writer. A subscriber must not
//! dispatch the runner/channel pair it is being called for, since that lock
//! is held for the duration of the pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, trace};

use crate::broker::channel::ChannelStats;
use crate::broker::engine::deliver;
use crate::broker::message::Message;
use crate::broker::registry::Registry;
use crate::broker::service::{Handler, Service};
use crate::config::StoreSettings;
use crate::persistence::runner::Runner;
use crate::persistence::sled_store::{Retention, Store};
use crate::utils::{BusError, lock};

#[derive(Debug)]
pub struct PersistentService {
    store: Store,
    registry: Registry,
    retention: Retention,
    runner_locks: Mutex<HashMap<(u64, String), Arc<Mutex<()>>>>,
    active: Mutex<HashMap<String, usize>>,
}

impl PersistentService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            registry: Registry::new(),
            retention: Retention::default(),
            runner_locks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the store at `settings.path` and adopts its retention policy.
    pub fn open(settings: &StoreSettings) -> Result<Self, BusError> {
        Ok(Self::new(Store::open(settings)?).with_retention(Retention::from_settings(settings)))
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Delivers pending messages to `runner` on each named channel, or on
    /// every durable channel when `channels` is empty.
    ///
    /// `limit` caps how many messages each channel delivers in this call.
    /// Returns the per-channel count. Stops at the first failure; counts for
    /// channels already processed are lost with it, but their offsets are
    /// persisted.
    pub fn dispatch(
        &self,
        runner: &str,
        channels: &[&str],
        limit: Option<usize>,
    ) -> Result<HashMap<String, usize>, BusError> {
        let names = if channels.is_empty() {
            self.store.channel_names()?
        } else {
            channels.iter().map(|name| name.to_string()).collect()
        };

        let mut counts = HashMap::with_capacity(names.len());
        for name in names {
            let delivered = self.dispatch_channel(runner, &name, limit)?;
            counts.insert(name, delivered);
        }
        Ok(counts)
    }

    fn dispatch_channel(
        &self,
        runner: &str,
        channel: &str,
        limit: Option<usize>,
    ) -> Result<usize, BusError> {
        let channel_id = self.store.channel_id(channel)?;

        let pair_lock = self.runner_lock(channel_id, runner);
        let _serialized = lock(&pair_lock);
        let _active = ActivePass::enter(&self.active, channel);

        let mut state = match self.store.load_runner(channel_id, runner)? {
            Some(existing) if existing.channel_id != channel_id || existing.name != runner => {
                return Err(BusError::CorruptRecord(format!(
                    "runner row `{}` (channel {}) found for runner `{runner}` on channel {channel_id}",
                    existing.id, existing.channel_id
                )));
            }
            Some(existing) => existing,
            None => {
                let created = Runner::new(runner, channel, channel_id);
                self.store.save_runner(&created)?;
                debug!(runner, channel, "runner created");
                created
            }
        };

        let pending = self
            .store
            .messages_after(channel_id, state.last_processed_id)
            .take(limit.unwrap_or(usize::MAX));

        let mut delivered = 0;
        for row in pending {
            let row = row?;
            let message = row.message()?;
            let subscribers = self
                .registry
                .get(channel)
                .map(|c| c.subscribers())
                .unwrap_or_default();

            deliver(channel, &message, &subscribers)?;

            state.advance(row.sequence, Utc::now());
            self.store.save_runner(&state)?;
            delivered += 1;
            trace!(runner, channel, sequence = row.sequence, "offset advanced");
        }

        if delivered > 0 {
            debug!(runner, channel, count = delivered, "dispatch finished");
        }
        Ok(delivered)
    }

    fn runner_lock(&self, channel_id: u64, runner: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            lock(&self.runner_locks)
                .entry((channel_id, runner.to_string()))
                .or_default(),
        )
    }

    /// Stats for `channel`, counting the queue from `runner`'s point of view.
    ///
    /// With a runner, `queue_size` is what that runner has not seen yet (the
    /// whole channel if it never dispatched). Without one, it is what the
    /// least-advanced runner has not seen: the messages some known consumer
    /// group still has pending. A channel nobody dispatched reports all of
    /// its messages.
    pub fn channel_stats_for(
        &self,
        channel: &str,
        runner: Option<&str>,
    ) -> Result<ChannelStats, BusError> {
        let channel_id = self.store.channel_id(channel)?;

        let after = match runner {
            Some(runner) => self
                .store
                .load_runner(channel_id, runner)?
                .and_then(|r| r.last_processed_id),
            None => self
                .store
                .runners_for(channel_id)?
                .iter()
                .map(|r| r.last_processed_id)
                .min()
                .flatten(),
        };

        Ok(ChannelStats {
            name: channel.to_string(),
            subscribers_count: self
                .registry
                .get(channel)
                .map_or(0, |c| c.subscribers_count()),
            queue_size: self.store.count_after(channel_id, after)?,
            dispatching: lock(&self.active).get(channel).is_some_and(|n| *n > 0),
        })
    }

    pub fn runner(&self, runner: &str, channel: &str) -> Result<Option<Runner>, BusError> {
        match self.store.find_channel(channel)? {
            Some(channel_id) => self.store.load_runner(channel_id, runner),
            None => Ok(None),
        }
    }

    /// Runners that have dispatched on `channel`, sorted by name.
    pub fn runners(&self, channel: &str) -> Result<Vec<Runner>, BusError> {
        match self.store.find_channel(channel)? {
            Some(channel_id) => self.store.runners_for(channel_id),
            None => Ok(Vec::new()),
        }
    }

    /// Applies the configured retention policy to `channel`.
    pub fn prune(&self, channel: &str) -> Result<usize, BusError> {
        match self.store.find_channel(channel)? {
            Some(channel_id) => self.store.prune(channel_id, &self.retention, Utc::now()),
            None => Ok(0),
        }
    }
}

impl Service for PersistentService {
    fn publish(&self, channel: &str, message: &Message) -> Result<(), BusError> {
        let channel_id = self.store.channel_id(channel)?;
        self.store.append(channel_id, message)?;
        Ok(())
    }

    fn subscribe_handler(&self, channel: &str, handler: Handler) -> Result<(), BusError> {
        self.registry.channel(channel).subscribe(handler);
        Ok(())
    }

    fn channel_stats(&self, channel: &str) -> Result<ChannelStats, BusError> {
        self.channel_stats_for(channel, None)
    }
}

/// Counts in-flight dispatch passes per channel for `dispatching` in stats.
struct ActivePass<'a> {
    active: &'a Mutex<HashMap<String, usize>>,
    channel: String,
}

impl<'a> ActivePass<'a> {
    fn enter(active: &'a Mutex<HashMap<String, usize>>, channel: &str) -> Self {
        *lock(active).entry(channel.to_string()).or_default() += 1;
        Self {
            active,
            channel: channel.to_string(),
        }
    }
}

impl Drop for ActivePass<'_> {
    fn drop(&mut self) {
        let mut active = lock(self.active);
        if let Some(count) = active.get_mut(&self.channel) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(&self.channel);
            }
        }
    }
}
