//! Cache manager: TTL reads, writes and group invalidation over the store.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheResult, StoredEntry, Ttl};
use super::groups::{CacheGroups, GroupSelector};
use crate::error::{Result, SyncError};
use crate::store::{StoreHandle, CACHE_NAMESPACE};

/// Source of "now" for TTL checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Cache of read results layered over the persistent store.
///
/// Never talks to the network on its own; on a miss the caller fetches and
/// calls [`CacheManager::set`], or uses [`CacheManager::fetch`].
#[derive(Clone)]
pub struct CacheManager {
  store: StoreHandle,
  groups: Arc<CacheGroups>,
  clock: Clock,
}

impl CacheManager {
  pub fn new(store: StoreHandle, groups: CacheGroups) -> Self {
    Self {
      store,
      groups: Arc::new(groups),
      clock: Arc::new(Utc::now),
    }
  }

  /// Replace the clock used for expiry checks.
  pub fn with_clock(mut self, clock: Clock) -> Self {
    self.clock = clock;
    self
  }

  pub fn groups(&self) -> &CacheGroups {
    &self.groups
  }

  fn now(&self) -> DateTime<Utc> {
    (self.clock)()
  }

  /// Read a value if present and within its TTL.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let now = self.now();
    self
      .entry(key)
      .filter(|entry| entry.is_fresh(now))
      .map(|entry| entry.value)
  }

  /// Read a value regardless of its TTL.
  ///
  /// Meant for the offline fallback only, so the UI is not left empty.
  pub fn get_ignoring_expiry<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.entry(key).map(|entry| entry.value)
  }

  /// Decode the full entry, expired or not. Storage and decode failures are
  /// reported as a miss.
  pub fn entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
    let bytes = match self.store.get(CACHE_NAMESPACE, key) {
      Ok(Some(bytes)) => bytes,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "cache read failed, treating as miss");
        return None;
      }
    };

    let stored: StoredEntry = match serde_json::from_slice(&bytes) {
      Ok(stored) => stored,
      Err(e) => {
        warn!(key, error = %e, "corrupt cache entry, treating as miss");
        return None;
      }
    };

    let stored_at = stored.stored_at();
    let ttl = stored.ttl();
    let value = match serde_json::from_value(stored.value) {
      Ok(value) => value,
      Err(e) => {
        warn!(key, error = %e, "cache entry has an unexpected type, treating as miss");
        return None;
      }
    };

    Some(CacheEntry {
      key: key.to_string(),
      value,
      stored_at,
      ttl,
    })
  }

  /// Store a value, overwriting any previous entry.
  pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Ttl) -> Result<()> {
    let stored = StoredEntry::new(serde_json::to_value(value)?, self.now(), ttl);
    let bytes = serde_json::to_vec(&stored)?;
    self.store.put(CACHE_NAMESPACE, key, &bytes)?;
    debug!(key, ?ttl, "cache set");
    Ok(())
  }

  pub fn invalidate(&self, key: &str) -> Result<()> {
    self.store.delete(CACHE_NAMESPACE, key)?;
    debug!(key, "cache invalidated");
    Ok(())
  }

  /// Remove every entry matched by the selector. Returns how many were removed.
  pub fn invalidate_group(&self, selector: &GroupSelector) -> Result<usize> {
    if let GroupSelector::Named(name) = selector {
      if self.groups.members(name).is_none() {
        warn!(group = %name, "unknown cache group, nothing invalidated");
        return Ok(0);
      }
    }

    let mut removed = 0;
    for key in self.store.keys(CACHE_NAMESPACE)? {
      if selector.matches(&self.groups, &key) {
        self.store.delete(CACHE_NAMESPACE, &key)?;
        removed += 1;
      }
    }

    debug!(?selector, removed, "cache group invalidated");
    Ok(removed)
  }

  /// Delete entries whose TTL has elapsed.
  pub fn purge_expired(&self) -> Result<usize> {
    let now = self.now();
    let mut removed = 0;

    for (key, bytes) in self.store.get_all(CACHE_NAMESPACE)? {
      let expired = match serde_json::from_slice::<StoredEntry>(&bytes) {
        Ok(stored) => {
          let entry = CacheEntry {
            key: key.clone(),
            value: (),
            stored_at: stored.stored_at(),
            ttl: stored.ttl(),
          };
          !entry.is_fresh(now)
        }
        // Unreadable entries can never be served
        Err(_) => true,
      };

      if expired {
        self.store.delete(CACHE_NAMESPACE, &key)?;
        removed += 1;
      }
    }

    Ok(removed)
  }

  /// All cached keys, fresh or not.
  pub fn keys(&self) -> Result<Vec<String>> {
    self.store.keys(CACHE_NAMESPACE)
  }

  /// Read-through fetch.
  ///
  /// 1. Fresh cache entry: return it
  /// 2. Offline: return the expired entry if any, without touching the network
  /// 3. Otherwise fetch; on success store with `ttl`
  /// 4. On fetch failure fall back to the expired entry (offline mode)
  pub async fn fetch<T, F, Fut>(
    &self,
    key: &str,
    ttl: Ttl,
    online: bool,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let cached = match self.entry::<T>(key) {
      Some(entry) if entry.is_fresh(self.now()) => {
        return Ok(CacheResult::from_cache(entry.value, entry.stored_at));
      }
      other => other,
    };

    if !online {
      return match cached {
        Some(entry) => Ok(CacheResult::offline(entry.value, entry.stored_at)),
        None => Err(SyncError::network("offline and nothing cached")),
      };
    }

    match fetcher().await {
      Ok(data) => {
        if let Err(e) = self.set(key, &data, ttl) {
          warn!(key, error = %e, "could not cache fetched data");
        }
        Ok(CacheResult::from_network(data))
      }
      Err(e) => match cached {
        Some(entry) => {
          debug!(key, error = %e, "fetch failed, serving expired entry");
          Ok(CacheResult::offline(entry.value, entry.stored_at))
        }
        None => Err(e),
      },
    }
  }
}
