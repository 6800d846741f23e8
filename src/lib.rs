//! Offline-first data layer for troop management clients.
//!
//! - [`store`]: durable namespaced key/value storage (SQLite)
//! - [`cache`]: TTL cache with named invalidation groups
//! - [`queue`]: FIFO queue of mutations made while offline
//! - [`optimistic`]: optimistic updates with snapshot rollback
//! - [`sync`]: debounced point batches, transport and offline replay
//! - [`bridge`]: messages to and from the background worker

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod optimistic;
pub mod queue;
pub mod store;
pub mod sync;

pub use error::{Result, SyncError};
