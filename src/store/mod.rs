//! Durable key/value storage shared by the cache and the offline queue.
//!
//! The store knows nothing about what it holds: records are opaque bytes
//! grouped by namespace. The cache manager writes only to [`CACHE_NAMESPACE`]
//! and the offline queue only to [`QUEUE_NAMESPACE`].

mod sqlite;

use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, SyncError};

pub use sqlite::SqliteStore;

/// Namespace holding TTL-tagged cache entries.
pub const CACHE_NAMESPACE: &str = "cache";

/// Namespace holding queued offline mutations.
pub const QUEUE_NAMESPACE: &str = "offline_queue";

/// Shared handle to a store implementation.
pub type StoreHandle = Arc<dyn PersistentStore>;

/// Trait for durable storage backends.
///
/// Implementations serialize their own writers, so callers never need an
/// external lock.
pub trait PersistentStore: Send + Sync {
  /// Insert or overwrite a record.
  fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;

  /// Fetch a record.
  fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

  /// All records in a namespace ordered by key.
  fn get_all(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>>;

  /// Remove a record. Missing keys are not an error.
  fn delete(&self, namespace: &str, key: &str) -> Result<()>;

  /// Remove every record in a namespace.
  fn clear(&self, namespace: &str) -> Result<()>;

  /// Store a record under the next sequence number of the namespace and
  /// return that number. Sequence numbers are never reused.
  fn append(&self, namespace: &str, value: &[u8]) -> Result<u64>;

  /// Keys of a namespace in order.
  fn keys(&self, namespace: &str) -> Result<Vec<String>> {
    Ok(
      self
        .get_all(namespace)?
        .into_iter()
        .map(|(key, _)| key)
        .collect(),
    )
  }
}

/// Key under which a sequence number is stored; zero-padded so key order is
/// sequence order.
pub fn sequence_key(seq: u64) -> String {
  format!("{:020}", seq)
}

/// Store used when durable storage is disabled or failed to open.
/// Reads always miss; writes report `StorageUnavailable`.
pub struct NoopStore {
  reason: String,
}

impl NoopStore {
  pub fn new(reason: impl Into<String>) -> Self {
    Self {
      reason: reason.into(),
    }
  }

  fn unavailable(&self) -> SyncError {
    SyncError::storage(self.reason.clone())
  }
}

impl PersistentStore for NoopStore {
  fn put(&self, _namespace: &str, _key: &str, _value: &[u8]) -> Result<()> {
    Err(self.unavailable())
  }

  fn get(&self, _namespace: &str, _key: &str) -> Result<Option<Vec<u8>>> {
    Ok(None) // Always miss
  }

  fn get_all(&self, _namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
    Ok(Vec::new())
  }

  fn delete(&self, _namespace: &str, _key: &str) -> Result<()> {
    Ok(()) // Nothing to delete
  }

  fn clear(&self, _namespace: &str) -> Result<()> {
    Ok(())
  }

  fn append(&self, _namespace: &str, _value: &[u8]) -> Result<u64> {
    Err(self.unavailable())
  }
}

/// Open the SQLite store, falling back to a [`NoopStore`] when that fails.
///
/// `path = None` selects the default location under the user data directory.
pub fn open_or_degrade(path: Option<&Path>) -> StoreHandle {
  let opened = match path {
    Some(p) => SqliteStore::open_at(p),
    None => SqliteStore::open(),
  };

  match opened {
    Ok(store) => Arc::new(store),
    Err(e) => {
      tracing::warn!(error = %e, "durable storage unavailable, caching and offline queue disabled");
      Arc::new(NoopStore::new(e.to_string()))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sequence_keys_sort_numerically() {
    let mut keys = vec![sequence_key(10), sequence_key(9), sequence_key(100)];
    keys.sort();
    assert_eq!(keys, vec![sequence_key(9), sequence_key(10), sequence_key(100)]);
  }

  #[test]
  fn test_noop_store_misses_and_refuses_writes() {
    let store = NoopStore::new("disabled");
    assert_eq!(store.get(CACHE_NAMESPACE, "k").unwrap(), None);
    assert!(store.get_all(QUEUE_NAMESPACE).unwrap().is_empty());
    assert!(matches!(
      store.put(CACHE_NAMESPACE, "k", b"v"),
      Err(SyncError::StorageUnavailable { .. })
    ));
    assert!(matches!(
      store.append(QUEUE_NAMESPACE, b"v"),
      Err(SyncError::StorageUnavailable { .. })
    ));
  }

  #[test]
  fn test_open_or_degrade_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    // A directory cannot be opened as a database file
    let store = open_or_degrade(Some(dir.path()));
    assert!(store.put(CACHE_NAMESPACE, "k", b"v").is_err());
    assert_eq!(store.get(CACHE_NAMESPACE, "k").unwrap(), None);
  }
}
