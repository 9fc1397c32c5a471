//! Dispatch engine
//!
//! The drain loop shared by the in-memory services:
//! - claims the channel's `dispatching` flag (one pass per channel at a time)
//! - pops and decodes messages oldest first, until the queue is seen empty,
//!   so messages published mid-pass are picked up by the same pass
//! - offers each message to every subscriber in registration order
//!
//! Failure contract: when a subscriber fails, the other subscribers still
//! receive that message, then the pass stops and the first failure is
//! returned. The failed message has already left the queue and is not
//! redelivered; everything behind it stays queued for the next pass.
//!
//! There is no timeout. A subscriber that never returns holds the channel's
//! pass for as long as it runs.

use tracing::{error, trace};

use crate::broker::channel::Channel;
use crate::broker::message::Message;
use crate::broker::service::Handler;
use crate::utils::BusError;

/// Drains `channel`, returning how many messages were fully delivered.
///
/// Returns `Ok(0)` without touching the queue if another pass is running.
pub fn dispatch_channel(channel: &Channel) -> Result<usize, BusError> {
    let Some(_pass) = channel.try_begin_dispatch() else {
        trace!(channel = channel.name(), "dispatch already in progress");
        return Ok(0);
    };

    let mut delivered = 0;
    while let Some(encoded) = channel.pop() {
        let message = Message::decode(&encoded)?;
        deliver(channel.name(), &message, &channel.subscribers())?;
        delivered += 1;
    }

    if delivered > 0 {
        trace!(channel = channel.name(), count = delivered, "dispatch pass finished");
    }
    Ok(delivered)
}

/// Invokes every handler with `message`. All handlers run even if an
/// earlier one fails; the first failure is reported.
pub(crate) fn deliver(
    channel: &str,
    message: &Message,
    subscribers: &[Handler],
) -> Result<(), BusError> {
    let mut failure = None;

    for handler in subscribers {
        if let Err(source) = handler(message) {
            error!(
                channel,
                message_id = %message.id(),
                error = %source,
                "subscriber failed"
            );
            if failure.is_none() {
                failure = Some(source);
            }
        }
    }

    match failure {
        Some(source) => Err(BusError::Subscriber {
            channel: channel.to_string(),
            message_id: message.id(),
            source,
        }),
        None => Ok(()),
    }
}
