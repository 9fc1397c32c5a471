//! # relaybus
//!
//! `relaybus` is an in-process publish/subscribe bus with an optional
//! durable backing store.
//!
//! ## Core Modules
//!
//! - `broker`: messages, channels, the dispatch engine and the two in-memory
//!   services (caller-driven `InMemoryService`, worker-per-channel
//!   `ThreadedService`), plus `bridge` to forward a channel between services.
//! - `persistence`: the sled-backed `PersistentService`, where named runners
//!   replay channels independently with at-least-once delivery.
//! - `config`: loads `Settings` from files and the environment.
//! - `utils`: the shared `BusError` type and logging setup.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod utils;

pub use broker::{
    Channel, ChannelStats, Handler, HandlerResult, InMemoryService, Message, Payload, Service,
    ThreadedService, bridge,
};
pub use persistence::{PersistentService, Runner, Store};
pub use utils::{BusError, HandlerError};
