//! In-process publish/subscribe.
//!
//! - `message`: the immutable, serializable unit that flows through the bus
//! - `channel` / `registry`: per-channel queue, subscribers and dispatch flag
//! - `engine`: the single-flight drain loop shared by the in-memory services
//! - `memory`: caller-driven dispatch
//! - `threaded`: one background worker per channel
//! - `bridge`: forward a channel from one service to another

pub mod bridge;
pub mod channel;
pub mod engine;
pub mod memory;
pub mod message;
pub mod registry;
pub mod service;
pub mod threaded;

pub use bridge::bridge;
pub use channel::{Channel, ChannelStats};
pub use engine::dispatch_channel;
pub use memory::InMemoryService;
pub use message::{Message, Payload};
pub use registry::Registry;
pub use service::{Handler, HandlerResult, Service};
pub use threaded::ThreadedService;

#[cfg(test)]
mod tests;
