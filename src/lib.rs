//! Offline-first sync engine for a journal client.
//!
//! Reads go through a [`router::Router`] that serves them from versioned
//! response cache partitions or the network. Writes made while offline are
//! kept in a durable outbox and replayed in order by the
//! [`sync::Reconciler`] once connectivity returns. [`engine::SyncEngine`]
//! owns all of it.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod router;
pub mod store;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use engine::{MutationOutcome, SyncEngine};
pub use error::{Result, SyncError};
