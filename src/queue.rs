//! Durable FIFO queue of mutations captured while offline.
//!
//! The queue is drained as a whole: [`OfflineQueue::drain_all`] hands out a
//! read-only snapshot and [`OfflineQueue::clear_through`] removes that
//! snapshot only once every item in it was applied server-side.
//! [`OfflineQueue::remove`] drops single items the server refused for good.
//! A failed replay leaves everything else in place, so a later drain may send
//! items the server already accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{sequence_key, StoreHandle, QUEUE_NAMESPACE};

/// Action name used for queued point changes.
pub const UPDATE_POINTS_ACTION: &str = "updatePoints";

/// A mutation waiting for connectivity.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMutation {
  /// Sequence number assigned at enqueue time
  pub id: u64,
  /// Names the remote operation to replay
  pub action: String,
  pub payload: serde_json::Value,
  pub enqueued_at: DateTime<Utc>,
}

/// On-disk shape of a queued mutation.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMutation {
  action: String,
  payload: serde_json::Value,
  timestamp: DateTime<Utc>,
}

/// Offline queue over the persistent store.
#[derive(Clone)]
pub struct OfflineQueue {
  store: StoreHandle,
}

impl OfflineQueue {
  pub fn new(store: StoreHandle) -> Self {
    Self { store }
  }

  /// Append a mutation. Fails only when the store is unavailable.
  pub fn enqueue<P: Serialize + ?Sized>(&self, action: &str, payload: &P) -> Result<QueuedMutation> {
    let record = StoredMutation {
      action: action.to_string(),
      payload: serde_json::to_value(payload)?,
      timestamp: Utc::now(),
    };
    let bytes = serde_json::to_vec(&record)?;
    let id = self.store.append(QUEUE_NAMESPACE, &bytes)?;

    debug!(id, action, "mutation queued offline");

    Ok(QueuedMutation {
      id,
      action: record.action,
      payload: record.payload,
      enqueued_at: record.timestamp,
    })
  }

  /// Every queued mutation in enqueue order. Nothing is removed.
  ///
  /// An unreadable store reports an empty queue.
  pub fn drain_all(&self) -> Vec<QueuedMutation> {
    let records = match self.store.get_all(QUEUE_NAMESPACE) {
      Ok(records) => records,
      Err(e) => {
        warn!(error = %e, "offline queue unreadable, treating as empty");
        return Vec::new();
      }
    };

    records
      .into_iter()
      .filter_map(|(key, bytes)| {
        let id = match key.parse::<u64>() {
          Ok(id) => id,
          Err(_) => {
            warn!(key, "queued mutation has a non-numeric key, skipping");
            return None;
          }
        };
        match serde_json::from_slice::<StoredMutation>(&bytes) {
          Ok(record) => Some(QueuedMutation {
            id,
            action: record.action,
            payload: record.payload,
            enqueued_at: record.timestamp,
          }),
          Err(e) => {
            warn!(id, error = %e, "corrupt queued mutation, skipping");
            None
          }
        }
      })
      .collect()
  }

  /// Empty the queue. Call only after a fully successful replay.
  pub fn clear(&self) -> Result<()> {
    self.store.clear(QUEUE_NAMESPACE)?;
    debug!("offline queue cleared");
    Ok(())
  }

  /// Remove every item with an id up to and including `last_id`. Items
  /// queued after a drain snapshot was taken survive.
  pub fn clear_through(&self, last_id: u64) -> Result<usize> {
    let keys = self.store.keys(QUEUE_NAMESPACE)?;
    let mut removed = 0;
    for key in keys {
      match key.parse::<u64>() {
        Ok(id) if id <= last_id => {
          self.store.delete(QUEUE_NAMESPACE, &key)?;
          removed += 1;
        }
        Ok(_) => {}
        // Unparseable keys are skipped by drain_all, so they can never be
        // replayed either
        Err(_) => {
          self.store.delete(QUEUE_NAMESPACE, &key)?;
        }
      }
    }
    debug!(last_id, removed, "offline queue trimmed");
    Ok(removed)
  }

  /// Drop specific items, e.g. ones the server refused for good.
  pub fn remove(&self, ids: &[u64]) -> Result<()> {
    for id in ids {
      self.store.delete(QUEUE_NAMESPACE, &sequence_key(*id))?;
    }
    debug!(?ids, "queued mutations removed");
    Ok(())
  }

  pub fn len(&self) -> usize {
    self
      .store
      .keys(QUEUE_NAMESPACE)
      .map(|keys| keys.len())
      .unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::SyncError;
  use crate::store::{NoopStore, SqliteStore};
  use serde_json::json;
  use std::sync::Arc;

  #[test]
  fn test_fifo_order() {
    let queue = OfflineQueue::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
    queue.enqueue(UPDATE_POINTS_ACTION, &json!({"id": 1, "points": 2})).unwrap();
    queue.enqueue("saveAttendance", &json!({"id": 7, "status": "present"})).unwrap();
    queue.enqueue(UPDATE_POINTS_ACTION, &json!({"id": 1, "points": -1})).unwrap();

    let items = queue.drain_all();
    let actions: Vec<&str> = items.iter().map(|m| m.action.as_str()).collect();
    assert_eq!(actions, vec![UPDATE_POINTS_ACTION, "saveAttendance", UPDATE_POINTS_ACTION]);
    assert_eq!(items[2].payload["points"], -1);

    // drain is a snapshot, not a pop
    assert_eq!(queue.len(), 3);
  }

  #[test]
  fn test_clear_empties_queue() {
    let queue = OfflineQueue::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
    queue.enqueue(UPDATE_POINTS_ACTION, &json!({})).unwrap();
    queue.clear().unwrap();
    assert!(queue.is_empty());
    assert!(queue.drain_all().is_empty());
  }

  #[test]
  fn test_clear_through_keeps_late_arrivals() {
    let queue = OfflineQueue::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
    queue.enqueue(UPDATE_POINTS_ACTION, &json!({"points": 1})).unwrap();
    queue.enqueue(UPDATE_POINTS_ACTION, &json!({"points": 2})).unwrap();
    let snapshot = queue.drain_all();

    let late = queue.enqueue(UPDATE_POINTS_ACTION, &json!({"points": 3})).unwrap();
    let last = snapshot.last().unwrap().id;
    assert_eq!(queue.clear_through(last).unwrap(), 2);

    let remaining = queue.drain_all();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, late.id);
  }

  #[test]
  fn test_remove_single_items() {
    let queue = OfflineQueue::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
    let a = queue.enqueue(UPDATE_POINTS_ACTION, &json!({"points": 1})).unwrap();
    let b = queue.enqueue(UPDATE_POINTS_ACTION, &json!({"points": 2})).unwrap();
    let c = queue.enqueue(UPDATE_POINTS_ACTION, &json!({"points": 3})).unwrap();

    queue.remove(&[b.id]).unwrap();

    let ids: Vec<u64> = queue.drain_all().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![a.id, c.id]);
  }

  #[test]
  fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    let before = {
      let queue = OfflineQueue::new(Arc::new(SqliteStore::open_at(&path).unwrap()));
      queue
        .enqueue(UPDATE_POINTS_ACTION, &json!({"type": "individual", "id": 42, "points": 3}))
        .unwrap();
      queue
        .enqueue(UPDATE_POINTS_ACTION, &json!({"type": "group", "id": 5, "points": 1}))
        .unwrap();
      queue.drain_all()
    };

    let queue = OfflineQueue::new(Arc::new(SqliteStore::open_at(&path).unwrap()));
    assert_eq!(queue.drain_all(), before);
  }

  #[test]
  fn test_unavailable_store() {
    let queue = OfflineQueue::new(Arc::new(NoopStore::new("disabled")));
    assert!(matches!(
      queue.enqueue(UPDATE_POINTS_ACTION, &json!({})),
      Err(SyncError::StorageUnavailable { .. })
    ));
    assert!(queue.drain_all().is_empty());
    assert_eq!(queue.len(), 0);
  }
}
