use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError, RwLock};

use serde::Serialize;

use crate::broker::service::Handler;
use crate::utils::{BusError, lock, read, write};

/// Snapshot returned by `channel_stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub name: String,
    pub subscribers_count: usize,
    pub queue_size: usize,
    pub dispatching: bool,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<Vec<u8>>,
    closed: bool,
}

/// Per-channel state: the queue of encoded messages waiting for dispatch,
/// the subscriber list and the flag that keeps dispatch single-flight.
///
/// The queue is the only part a worker ever blocks on; `ready` is signalled
/// on every push and when the queue is closed.
pub struct Channel {
    name: String,
    queue: Mutex<Queue>,
    ready: Condvar,
    subscribers: RwLock<Vec<Handler>>,
    dispatching: AtomicBool,
}

impl Channel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
            subscribers: RwLock::new(Vec::new()),
            dispatching: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends an encoded message at the back of the queue.
    pub fn push(&self, encoded: Vec<u8>) -> Result<(), BusError> {
        let mut queue = lock(&self.queue);
        if queue.closed {
            return Err(BusError::ServiceClosed {
                channel: self.name.clone(),
            });
        }
        queue.pending.push_back(encoded);
        self.ready.notify_one();
        Ok(())
    }

    pub(crate) fn pop(&self) -> Option<Vec<u8>> {
        lock(&self.queue).pending.pop_front()
    }

    pub fn subscribe(&self, handler: Handler) {
        write(&self.subscribers).push(handler);
    }

    /// Copy of the current subscriber list, in registration order.
    pub fn subscribers(&self) -> Vec<Handler> {
        read(&self.subscribers).clone()
    }

    pub fn subscribers_count(&self) -> usize {
        read(&self.subscribers).len()
    }

    pub fn queue_size(&self) -> usize {
        lock(&self.queue).pending.len()
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatching.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            name: self.name.clone(),
            subscribers_count: self.subscribers_count(),
            queue_size: self.queue_size(),
            dispatching: self.is_dispatching(),
        }
    }

    /// Claims the dispatching flag. `None` means another pass already holds it.
    pub(crate) fn try_begin_dispatch(&self) -> Option<DispatchGuard<'_>> {
        self.dispatching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DispatchGuard {
                flag: &self.dispatching,
            })
    }

    /// Blocks until there is something to drain. Returns `false` once the
    /// queue is closed and empty, which is the worker's signal to exit.
    pub(crate) fn wait_for_work(&self) -> bool {
        let mut queue = lock(&self.queue);
        while queue.pending.is_empty() && !queue.closed {
            queue = self
                .ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
        !queue.pending.is_empty()
    }

    /// Refuses further pushes and wakes any blocked worker. Already queued
    /// messages stay in place to be drained.
    pub(crate) fn close(&self) {
        lock(&self.queue).closed = true;
        self.ready.notify_all();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("queue_size", &self.queue_size())
            .field("subscribers", &self.subscribers_count())
            .field("dispatching", &self.is_dispatching())
            .finish()
    }
}

/// Clears the dispatching flag on drop, including when a subscriber panics.
pub(crate) struct DispatchGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
