use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::broker::channel::Channel;
use crate::utils::{BusError, lock};

/// Lazily created channels, keyed by name.
///
/// Creation happens under a single mutex, so concurrent first access to a
/// name still yields exactly one `Channel`.
#[derive(Debug, Default)]
pub struct Registry {
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel called `name`, creating it if needed.
    pub fn channel(&self, name: &str) -> Arc<Channel> {
        let mut channels = lock(&self.channels);
        Arc::clone(channels.entry(name.to_string()).or_insert_with(|| {
            debug!(channel = name, "channel created");
            Arc::new(Channel::new(name))
        }))
    }

    /// Like [`Registry::channel`], but runs `on_create` for a brand-new
    /// channel while the registry lock is still held. If the hook fails the
    /// channel is not registered.
    pub fn get_or_create<F>(&self, name: &str, on_create: F) -> Result<Arc<Channel>, BusError>
    where
        F: FnOnce(&Arc<Channel>) -> Result<(), BusError>,
    {
        let mut channels = lock(&self.channels);
        if let Some(existing) = channels.get(name) {
            return Ok(Arc::clone(existing));
        }

        let channel = Arc::new(Channel::new(name));
        on_create(&channel)?;
        channels.insert(name.to_string(), Arc::clone(&channel));
        debug!(channel = name, "channel created");
        Ok(channel)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        lock(&self.channels).get(name).cloned()
    }

    /// Known channel names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.channels).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        lock(&self.channels).values().cloned().collect()
    }
}
