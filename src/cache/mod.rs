//! Cache of read results with TTL expiry and group invalidation.
//!
//! This module provides:
//! - TTL-tagged entries that expire lazily at read time
//! - An ignore-expiry read used as the offline fallback
//! - Invalidation by key, by named key group, or by prefix
//! - A read-through `fetch` that serves stale entries when the network is gone

mod entry;
mod groups;
mod manager;

pub use entry::{CacheEntry, CacheResult, CacheSource, Ttl};
pub use groups::{CacheGroups, GroupSelector};
pub use manager::{CacheManager, Clock};
