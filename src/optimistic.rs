//! Optimistic updates with snapshot rollback.
//!
//! Each operation runs four phases under a caller-chosen update key:
//!
//! ```ignore
//! let view = view.clone();
//! let op = OptimisticOp::new(
//!     move || view.bump(target, 3),          // returns the rollback snapshot
//!     move || async move { api.add_points(target, 3).await },
//! )
//! .on_success(|total| view.set(target, *total))
//! .on_rollback(|previous, _err| view.set(target, previous));
//!
//! manager.execute("points:individual:42:1700000000", op).await?;
//! ```
//!
//! Operations on different keys may overlap. Operations on the same key are
//! serialized: the second one starts only after the first has settled, so the
//! visible state never mixes two attempts on one key.

use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

type OptimisticFn<S> = Box<dyn FnOnce() -> S + Send>;
type RemoteFn<R> = Box<dyn FnOnce() -> BoxFuture<'static, Result<R>> + Send>;
type SuccessFn<R> = Box<dyn FnOnce(&R) + Send>;
type RollbackFn<S> = Box<dyn FnOnce(S, &SyncError) + Send>;
type ErrorFn = Box<dyn FnOnce(&SyncError) + Send>;

/// One optimistic mutation: the tentative effect, the remote call, and the
/// callbacks that settle it.
pub struct OptimisticOp<S, R> {
  optimistic: OptimisticFn<S>,
  remote: RemoteFn<R>,
  on_success: Option<SuccessFn<R>>,
  on_rollback: Option<RollbackFn<S>>,
  on_error: Option<ErrorFn>,
}

impl<S: Send + 'static, R: Send + 'static> OptimisticOp<S, R> {
  /// `optimistic` mutates visible state right away and returns whatever
  /// `on_rollback` needs to undo exactly that change.
  pub fn new<O, A, Fut>(optimistic: O, remote: A) -> Self
  where
    O: FnOnce() -> S + Send + 'static,
    A: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    Self {
      optimistic: Box::new(optimistic),
      remote: Box::new(move || Box::pin(remote())),
      on_success: None,
      on_rollback: None,
      on_error: None,
    }
  }

  /// Called with the server result; typically replaces the optimistic guess
  /// with the authoritative value.
  pub fn on_success<F>(mut self, f: F) -> Self
  where
    F: FnOnce(&R) + Send + 'static,
  {
    self.on_success = Some(Box::new(f));
    self
  }

  /// Called with the snapshot when the remote call fails.
  pub fn on_rollback<F>(mut self, f: F) -> Self
  where
    F: FnOnce(S, &SyncError) + Send + 'static,
  {
    self.on_rollback = Some(Box::new(f));
    self
  }

  /// Called after rollback, e.g. to surface a message.
  pub fn on_error<F>(mut self, f: F) -> Self
  where
    F: FnOnce(&SyncError) + Send + 'static,
  {
    self.on_error = Some(Box::new(f));
    self
  }
}

/// State of an update key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
  Idle,
  Pending,
}

/// Runs optimistic operations, at most one in flight per update key.
#[derive(Debug, Default)]
pub struct OptimisticManager {
  /// Per-key locks; an entry exists while someone holds or waits for the key
  slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
  pending: Mutex<HashSet<String>>,
}

impl OptimisticManager {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn state(&self, key: &str) -> UpdateState {
    let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
    if pending.contains(key) {
      UpdateState::Pending
    } else {
      UpdateState::Idle
    }
  }

  pub fn pending_count(&self) -> usize {
    self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  /// Run `op` under `key`, waiting for any pending operation on the same key
  /// to settle first.
  ///
  /// Resolves to the remote result after commit, or to the remote error after
  /// rollback.
  pub async fn execute<S, R>(&self, key: &str, op: OptimisticOp<S, R>) -> Result<R> {
    let slot = KeySlot::acquire(self, key);
    let _guard = slot.lock().lock().await;
    self.run(key, op).await
  }

  /// Like [`execute`](Self::execute) but fails with `UpdateInFlight` instead
  /// of waiting when the key is busy.
  pub async fn try_execute<S, R>(&self, key: &str, op: OptimisticOp<S, R>) -> Result<R> {
    let slot = KeySlot::acquire(self, key);
    let _guard = match slot.lock().try_lock() {
      Ok(guard) => guard,
      Err(_) => {
        debug!(key, "update already in flight, rejecting");
        return Err(SyncError::UpdateInFlight {
          key: key.to_string(),
        });
      }
    };
    self.run(key, op).await
  }

  async fn run<S, R>(&self, key: &str, op: OptimisticOp<S, R>) -> Result<R> {
    let _pending = PendingMark::new(self, key);

    let snapshot = (op.optimistic)();
    debug!(key, "optimistic update applied");

    match (op.remote)().await {
      Ok(result) => {
        drop(snapshot);
        if let Some(f) = op.on_success {
          f(&result);
        }
        debug!(key, "optimistic update committed");
        Ok(result)
      }
      Err(err) => {
        if let Some(f) = op.on_rollback {
          f(snapshot, &err);
        }
        if let Some(f) = op.on_error {
          f(&err);
        }
        warn!(key, error = %err, "optimistic update rolled back");
        Err(err)
      }
    }
  }
}

/// Reference to a key's lock; drops the map entry once nobody uses it.
struct KeySlot<'a> {
  manager: &'a OptimisticManager,
  key: String,
  lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> KeySlot<'a> {
  fn acquire(manager: &'a OptimisticManager, key: &str) -> Self {
    let mut slots = manager.slots.lock().unwrap_or_else(|e| e.into_inner());
    let lock = slots.entry(key.to_string()).or_default().clone();
    Self {
      manager,
      key: key.to_string(),
      lock,
    }
  }

  fn lock(&self) -> &tokio::sync::Mutex<()> {
    &self.lock
  }
}

impl Drop for KeySlot<'_> {
  fn drop(&mut self) {
    let mut slots = self.manager.slots.lock().unwrap_or_else(|e| e.into_inner());
    // One reference in the map, one here
    if Arc::strong_count(&self.lock) == 2 {
      slots.remove(&self.key);
    }
  }
}

/// Marks a key pending for as long as it lives.
struct PendingMark<'a> {
  manager: &'a OptimisticManager,
  key: String,
}

impl<'a> PendingMark<'a> {
  fn new(manager: &'a OptimisticManager, key: &str) -> Self {
    manager
      .pending
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(key.to_string());
    Self {
      manager,
      key: key.to_string(),
    }
  }
}

impl Drop for PendingMark<'_> {
  fn drop(&mut self) {
    self
      .manager
      .pending
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(&self.key);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicI64, Ordering};
  use std::time::Duration;
  use tokio::sync::oneshot;

  /// Counter standing in for a displayed value.
  fn counter(value: i64) -> Arc<AtomicI64> {
    Arc::new(AtomicI64::new(value))
  }

  fn bump_op(
    shown: &Arc<AtomicI64>,
    delta: i64,
    server: Result<i64>,
  ) -> OptimisticOp<i64, i64> {
    let apply = shown.clone();
    let commit = shown.clone();
    let undo = shown.clone();
    OptimisticOp::new(
      move || apply.fetch_add(delta, Ordering::SeqCst),
      move || async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        server
      },
    )
    .on_success(move |total| commit.store(*total, Ordering::SeqCst))
    .on_rollback(move |previous, _| undo.store(previous, Ordering::SeqCst))
  }

  #[tokio::test]
  async fn test_commit_uses_server_value() {
    let manager = OptimisticManager::new();
    let shown = counter(10);

    // Optimistic +5 would show 15; the server also applied someone else's +2
    let result = manager.execute("p:42", bump_op(&shown, 5, Ok(17))).await;

    assert_eq!(result, Ok(17));
    assert_eq!(shown.load(Ordering::SeqCst), 17);
    assert_eq!(manager.state("p:42"), UpdateState::Idle);
  }

  #[tokio::test]
  async fn test_rollback_restores_exact_state() {
    let manager = OptimisticManager::new();
    let shown = counter(10);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = errors.clone();

    let op = bump_op(&shown, 5, Err(SyncError::network("offline")))
      .on_error(move |e| seen.lock().unwrap().push(e.clone()));

    let result = manager.execute("p:42", op).await;

    assert!(matches!(result, Err(SyncError::NetworkFailure { .. })));
    assert_eq!(shown.load(Ordering::SeqCst), 10);
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert_eq!(manager.pending_count(), 0);
  }

  #[tokio::test]
  async fn test_same_key_operations_never_overlap() {
    let manager = OptimisticManager::new();
    let shown = counter(0);
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let make = |name: &'static str, delta: i64, total: i64| {
      let apply_log = log.clone();
      let settle_log = log.clone();
      let apply = shown.clone();
      let commit = shown.clone();
      OptimisticOp::new(
        move || {
          let before = apply.fetch_add(delta, Ordering::SeqCst);
          apply_log.lock().unwrap().push(format!("{} apply saw {}", name, before));
          before
        },
        move || async move {
          tokio::time::sleep(Duration::from_millis(20)).await;
          Ok(total)
        },
      )
      .on_success(move |t| {
        commit.store(*t, Ordering::SeqCst);
        settle_log.lock().unwrap().push(format!("{} settled", name));
      })
    };

    let (a, b) = tokio::join!(
      manager.execute("same", make("first", 1, 100)),
      manager.execute("same", make("second", 1, 200)),
    );

    assert_eq!((a, b), (Ok(100), Ok(200)));

    let log = log.lock().unwrap().clone();
    assert_eq!(log.len(), 4);
    let (winner, loser) = if log[0].starts_with("first") {
      (("first", 100), "second")
    } else {
      (("second", 200), "first")
    };
    assert_eq!(log[0], format!("{} apply saw 0", winner.0));
    assert_eq!(log[1], format!("{} settled", winner.0));
    // The second operation starts from the first one's settled value
    assert_eq!(log[2], format!("{} apply saw {}", loser, winner.1));
    assert_eq!(log[3], format!("{} settled", loser));
  }

  #[tokio::test]
  async fn test_different_keys_may_overlap() {
    let manager = OptimisticManager::new();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let slow = OptimisticOp::new(
      || (),
      move || async move {
        let _ = release_rx.await;
        Ok(1)
      },
    );
    let fast = OptimisticOp::new(|| (), || async { Ok(2) });

    let first = manager.execute("a", slow);
    let second = async {
      // "a" is still pending while "b" runs to completion
      tokio::task::yield_now().await;
      assert_eq!(manager.state("a"), UpdateState::Pending);
      let r = manager.execute("b", fast).await;
      let _ = release_tx.send(());
      r
    };

    let (a, b) = tokio::join!(first, second);
    assert_eq!((a, b), (Ok(1), Ok(2)));
  }

  #[tokio::test]
  async fn test_try_execute_rejects_busy_key() {
    let manager = OptimisticManager::new();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let slow = OptimisticOp::new(
      || (),
      move || async move {
        let _ = release_rx.await;
        Ok(())
      },
    );

    let first = manager.execute("k", slow);
    let second = async {
      tokio::task::yield_now().await;
      let r = manager
        .try_execute("k", OptimisticOp::new(|| (), || async { Ok(()) }))
        .await;
      let _ = release_tx.send(());
      r
    };

    let (a, b) = tokio::join!(first, second);
    assert_eq!(a, Ok(()));
    assert_eq!(
      b,
      Err(SyncError::UpdateInFlight {
        key: "k".to_string()
      })
    );
    assert_eq!(manager.state("k"), UpdateState::Idle);
  }
}
