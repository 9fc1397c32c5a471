//! The contract shared by every bus service.
//!
//! `dispatch` is deliberately left off the trait: the in-memory services
//! dispatch by channel name while the persistent one also needs a runner and
//! a limit, so each type exposes its own inherent `dispatch`.

use std::sync::Arc;

use crate::broker::channel::ChannelStats;
use crate::broker::message::Message;
use crate::utils::{BusError, HandlerError};

pub type HandlerResult = Result<(), HandlerError>;

/// A subscriber callback. Channels hold a reference; the registering caller
/// decides how long whatever it captures lives.
pub type Handler = Arc<dyn Fn(&Message) -> HandlerResult + Send + Sync>;

pub trait Service: Send + Sync {
    /// Hands `message` to `channel`, creating the channel on first use.
    fn publish(&self, channel: &str, message: &Message) -> Result<(), BusError>;

    fn subscribe_handler(&self, channel: &str, handler: Handler) -> Result<(), BusError>;

    /// Point-in-time snapshot; fields are read one after another and are not
    /// atomic as a group.
    fn channel_stats(&self, channel: &str) -> Result<ChannelStats, BusError>;

    fn subscribe<F>(&self, channel: &str, callback: F) -> Result<(), BusError>
    where
        F: Fn(&Message) -> HandlerResult + Send + Sync + 'static,
        Self: Sized,
    {
        self.subscribe_handler(channel, Arc::new(callback))
    }
}

impl<S: Service + ?Sized> Service for Arc<S> {
    fn publish(&self, channel: &str, message: &Message) -> Result<(), BusError> {
        (**self).publish(channel, message)
    }

    fn subscribe_handler(&self, channel: &str, handler: Handler) -> Result<(), BusError> {
        (**self).subscribe_handler(channel, handler)
    }

    fn channel_stats(&self, channel: &str) -> Result<ChannelStats, BusError> {
        (**self).channel_stats(channel)
    }
}
