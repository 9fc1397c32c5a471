use std::sync::Arc;

use tracing::debug;

use crate::broker::message::Message;
use crate::broker::service::{HandlerResult, Service};
use crate::utils::BusError;

/// Forwards every message delivered on `channel` of `source` to the same
/// channel of `target`, unchanged (same id, timestamp and attributes).
///
/// Typical use is fanning an in-process bus out to a durable one. A failed
/// republish surfaces as a subscriber failure on the source side.
pub fn bridge<S, T>(source: &S, target: Arc<T>, channel: &str) -> Result<(), BusError>
where
    S: Service + ?Sized,
    T: Service + ?Sized + 'static,
{
    let name = channel.to_string();
    source.subscribe_handler(
        channel,
        Arc::new(move |message: &Message| -> HandlerResult {
            target.publish(&name, message)?;
            Ok(())
        }),
    )?;
    debug!(channel, "bridge installed");
    Ok(())
}
