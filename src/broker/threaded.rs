//! Threaded in-memory bus
//!
//! Every channel owns one OS thread that sleeps on the channel's condition
//! variable and drains the queue through the dispatch engine as soon as
//! something is published. Callers never dispatch by hand.
//!
//! Lifecycle:
//! - a worker is spawned inside the registry lock when its channel is
//!   created, so there is exactly one per channel
//! - subscriber failures and panics are logged and the worker keeps going;
//!   a dead worker would silently stop all delivery for its channel
//! - `shutdown` closes every queue and joins every worker. Workers only exit
//!   once their queue is closed *and* empty, so shutdown drains instead of
//!   discarding. Dropping the service shuts it down as well.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace};

use crate::broker::channel::{Channel, ChannelStats};
use crate::broker::engine::dispatch_channel;
use crate::broker::message::Message;
use crate::broker::registry::Registry;
use crate::broker::service::{Handler, Service};
use crate::utils::{BusError, lock};

#[derive(Debug, Default)]
pub struct ThreadedService {
    registry: Registry,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ThreadedService {
    pub fn new() -> Self {
        Self::default()
    }

    /// No-op: workers deliver continuously. Kept so callers can treat the
    /// in-memory services alike; always returns an empty map.
    pub fn dispatch(&self, _channels: &[&str]) -> Result<HashMap<String, usize>, BusError> {
        Ok(HashMap::new())
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes every channel, then blocks until each worker has drained its
    /// queue and exited. Safe to call more than once.
    ///
    /// Calling this from inside a subscriber is allowed; the calling worker
    /// is not joined (it would be waiting on itself).
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for channel in self.registry.channels() {
            channel.close();
        }

        let workers = std::mem::take(&mut *lock(&self.workers));
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(worker = %name, "channel worker terminated abnormally");
            }
        }
    }

    fn channel(&self, name: &str) -> Result<Arc<Channel>, BusError> {
        self.registry.get_or_create(name, |channel| {
            // Checked under the registry lock, and shutdown raises the flag
            // before it snapshots the registry: a channel is either in that
            // snapshot or born closed.
            if self.closed.load(Ordering::Acquire) {
                channel.close();
                return Ok(());
            }

            let worker = Arc::clone(channel);
            let handle = thread::Builder::new()
                .name(format!("relaybus:{name}"))
                .spawn(move || run_worker(&worker))?;
            lock(&self.workers).push(handle);
            Ok(())
        })
    }
}

fn run_worker(channel: &Channel) {
    debug!(channel = channel.name(), "worker started");

    while channel.wait_for_work() {
        match panic::catch_unwind(AssertUnwindSafe(|| dispatch_channel(channel))) {
            Ok(Ok(count)) => trace!(channel = channel.name(), count, "worker pass done"),
            Ok(Err(err)) => {
                error!(channel = channel.name(), error = %err, "dispatch pass failed")
            }
            Err(_) => error!(channel = channel.name(), "subscriber panicked during dispatch"),
        }
    }

    debug!(channel = channel.name(), "worker stopped");
}

impl Service for ThreadedService {
    fn publish(&self, channel: &str, message: &Message) -> Result<(), BusError> {
        if self.is_shut_down() {
            return Err(BusError::ServiceClosed {
                channel: channel.to_string(),
            });
        }
        let encoded = message.encode()?;
        self.channel(channel)?.push(encoded)?;
        trace!(channel, message_id = %message.id(), "message queued");
        Ok(())
    }

    fn subscribe_handler(&self, channel: &str, handler: Handler) -> Result<(), BusError> {
        self.channel(channel)?.subscribe(handler);
        Ok(())
    }

    fn channel_stats(&self, channel: &str) -> Result<ChannelStats, BusError> {
        Ok(self.channel(channel)?.stats())
    }
}

impl Drop for ThreadedService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
