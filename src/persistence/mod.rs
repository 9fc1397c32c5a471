//! The `persistence` module provides the durable variant of the bus.
//!
//! Messages are kept in an embedded `sled` database, so a channel can be
//! replayed independently by any number of named runners (consumer groups),
//! each tracking its own offset. Retention is opt-in through
//! `PersistentService::prune`.

pub mod runner;
pub mod service;
pub mod sled_store;

pub use runner::Runner;
pub use service::PersistentService;
pub use sled_store::{Retention, Store, StoredMessage};
