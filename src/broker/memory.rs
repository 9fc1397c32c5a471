use std::collections::HashMap;

use tracing::trace;

use crate::broker::channel::ChannelStats;
use crate::broker::engine::dispatch_channel;
use crate::broker::message::Message;
use crate::broker::registry::Registry;
use crate::broker::service::{Handler, Service};
use crate::utils::BusError;

/// In-memory bus where delivery only happens when the caller asks for it.
///
/// `publish` queues, `dispatch` drains. Nothing runs in the background, which
/// makes this the variant of choice for tests and for request-scoped work
/// that flushes at a known point.
#[derive(Debug, Default)]
pub struct InMemoryService {
    registry: Registry,
}

impl InMemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one dispatch pass on each named channel, or on every known
    /// channel when `channels` is empty.
    ///
    /// Returns how many messages each channel delivered during this call.
    /// Naming a channel that does not exist reports `0` without creating it.
    pub fn dispatch(&self, channels: &[&str]) -> Result<HashMap<String, usize>, BusError> {
        let names = if channels.is_empty() {
            self.registry.names()
        } else {
            channels.iter().map(|name| name.to_string()).collect()
        };

        let mut counts = HashMap::with_capacity(names.len());
        for name in names {
            let delivered = match self.registry.get(&name) {
                Some(channel) => dispatch_channel(&channel)?,
                None => 0,
            };
            counts.insert(name, delivered);
        }
        Ok(counts)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.registry.names()
    }
}

impl Service for InMemoryService {
    fn publish(&self, channel: &str, message: &Message) -> Result<(), BusError> {
        let encoded = message.encode()?;
        self.registry.channel(channel).push(encoded)?;
        trace!(channel, message_id = %message.id(), "message queued");
        Ok(())
    }

    fn subscribe_handler(&self, channel: &str, handler: Handler) -> Result<(), BusError> {
        self.registry.channel(channel).subscribe(handler);
        Ok(())
    }

    fn channel_stats(&self, channel: &str) -> Result<ChannelStats, BusError> {
        Ok(self.registry.channel(channel).stats())
    }
}
