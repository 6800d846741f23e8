//! Connectivity tracking, debounced point batches, and offline replay.
//!
//! Point changes enter through [`SyncCoordinator::update_points`] (optimistic)
//! or [`SyncCoordinator::submit`] (plain). While online they gather in an
//! in-memory batch that is flushed as one request:
//!
//! ```text
//! submit ──► pending batch ──(debounce / leading edge)──► send_batch
//!                │                                          │
//!              offline                               ok │      │ err
//!                ▼                                      ▼      ▼
//!          offline queue ◄──── went offline ──── deliver   retryable: push back
//!                │                                         refused: drop
//!                │                                         offline: demote
//!           set_online(true)
//!                ▼
//!              drain ──► send_batch / send_mutation (FIFO)
//! ```

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::batch::{BatchRequestItem, BatchResponse, ItemUpdate, PendingBatchItem, Target};
use super::transport::BatchTransport;
use super::view::{apply_update, PointsView};
use crate::bridge::{AppState, SyncTrigger};
use crate::cache::{CacheManager, GroupSelector};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::optimistic::{OptimisticManager, OptimisticOp};
use crate::queue::{OfflineQueue, QueuedMutation, UPDATE_POINTS_ACTION};

type Waiter = oneshot::Sender<Result<ItemUpdate>>;

struct PendingEntry {
  item: PendingBatchItem,
  /// Absent for items retried after their optimistic operation rolled back
  waiter: Option<Waiter>,
}

#[derive(Default)]
struct BatchState {
  pending: VecDeque<PendingEntry>,
  /// Running while a batch window is open
  timer: Option<JoinHandle<()>>,
  /// Bumped on every timer restart; a stale timer finds a newer value
  window: u64,
  /// Operations whose change was demoted to the offline queue, by queue id
  offline_waiters: HashMap<u64, Waiter>,
}

struct Inner {
  settings: SyncConfig,
  cache: CacheManager,
  queue: OfflineQueue,
  optimistic: OptimisticManager,
  transport: Arc<dyn BatchTransport>,
  view: Arc<dyn PointsView>,
  online: watch::Sender<bool>,
  batch: Mutex<BatchState>,
  /// Serializes flushes so a pushed-back batch is never overtaken
  flush_lock: tokio::sync::Mutex<()>,
  drain_lock: tokio::sync::Mutex<()>,
  /// Requests in flight across flushes and drains
  syncing: AtomicUsize,
}

/// Counts one request in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
  fn new(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

/// Snapshot of the coordinator for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
  pub online: bool,
  /// A flush or drain request is in flight
  pub syncing: bool,
  /// Changes waiting in the batch window
  pub pending: usize,
  /// Mutations waiting in the offline queue
  pub queued: usize,
  /// Optimistic operations not yet settled
  pub in_flight: usize,
}

/// One coordinator per session; clones share state.
#[derive(Clone)]
pub struct SyncCoordinator {
  inner: Arc<Inner>,
}

/// A contiguous stretch of the drained queue sent as one request.
enum ReplayRun<'a> {
  Points(&'a [QueuedMutation]),
  Other(&'a QueuedMutation),
}

/// Split a drained queue into runs, keeping FIFO order. Adjacent point
/// changes share one batch request.
fn replay_runs(items: &[QueuedMutation]) -> Vec<ReplayRun<'_>> {
  let mut runs = Vec::new();
  let mut start = 0;
  while start < items.len() {
    if items[start].action == UPDATE_POINTS_ACTION {
      let len = items[start..]
        .iter()
        .take_while(|m| m.action == UPDATE_POINTS_ACTION)
        .count();
      runs.push(ReplayRun::Points(&items[start..start + len]));
      start += len;
    } else {
      runs.push(ReplayRun::Other(&items[start]));
      start += 1;
    }
  }
  runs
}

impl SyncCoordinator {
  /// Starts out online.
  pub fn new(
    settings: SyncConfig,
    cache: CacheManager,
    queue: OfflineQueue,
    transport: Arc<dyn BatchTransport>,
    view: Arc<dyn PointsView>,
  ) -> Self {
    let (online, _) = watch::channel(true);
    Self {
      inner: Arc::new(Inner {
        settings,
        cache,
        queue,
        optimistic: OptimisticManager::new(),
        transport,
        view,
        online,
        batch: Mutex::new(BatchState::default()),
        flush_lock: tokio::sync::Mutex::new(()),
        drain_lock: tokio::sync::Mutex::new(()),
        syncing: AtomicUsize::new(0),
      }),
    }
  }

  pub fn settings(&self) -> &SyncConfig {
    &self.inner.settings
  }

  pub fn cache(&self) -> &CacheManager {
    &self.inner.cache
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.inner.queue
  }

  pub fn optimistic(&self) -> &OptimisticManager {
    &self.inner.optimistic
  }

  pub fn is_online(&self) -> bool {
    *self.inner.online.borrow()
  }

  /// Watch connectivity changes.
  pub fn connectivity(&self) -> watch::Receiver<bool> {
    self.inner.online.subscribe()
  }

  pub fn status(&self) -> SyncStatus {
    SyncStatus {
      online: self.is_online(),
      syncing: self.inner.syncing.load(Ordering::SeqCst) > 0,
      pending: self.lock_batch().pending.len(),
      queued: self.inner.queue.len(),
      in_flight: self.inner.optimistic.pending_count(),
    }
  }

  fn lock_batch(&self) -> MutexGuard<'_, BatchState> {
    self.inner.batch.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn begin_request(&self) -> InFlight<'_> {
    InFlight::new(&self.inner.syncing)
  }

  /// Record a connectivity change.
  ///
  /// Going online invalidates the stale-on-reconnect cache groups, replays
  /// the offline queue and flushes the pending batch. Returns how many
  /// changes were sent.
  pub async fn set_online(&self, online: bool) -> Result<usize> {
    let was_online = self.inner.online.send_replace(online);
    if was_online == online {
      return Ok(0);
    }

    if !online {
      info!("connectivity lost, new changes will be queued offline");
      return Ok(0);
    }

    info!("connectivity restored");
    for group in &self.inner.settings.reconnect_invalidate {
      if let Err(e) = self.inner.cache.invalidate_group(&GroupSelector::named(group.as_str())) {
        warn!(group = %group, error = %e, "could not invalidate cache group");
      }
    }

    let replayed = self.drain_offline().await?;
    let flushed = self.flush().await?;
    Ok(replayed + flushed)
  }

  /// Apply a point change optimistically and sync it.
  ///
  /// The view shows the new total at once. Resolves after the server
  /// confirmed the change (the view then shows the server total) or after a
  /// failure rolled the view back. A change made offline stays pending until
  /// the offline queue drains.
  pub async fn update_points(&self, item: PendingBatchItem) -> Result<ItemUpdate> {
    let target = item.target();
    let delta = item.delta;
    let key = item.update_key();
    let view = self.inner.view.clone();
    let this = self.clone();

    let op = OptimisticOp::new(
      {
        let view = view.clone();
        move || {
          let previous = view.points(target);
          view.set_points(target, previous + delta);
          previous
        }
      },
      move || {
        let receiver = this.submit(item);
        async move {
          receiver
            .await
            .unwrap_or_else(|_| Err(SyncError::network("sync coordinator dropped the change")))
        }
      },
    )
    .on_success({
      let view = view.clone();
      move |update: &ItemUpdate| apply_update(view.as_ref(), update)
    })
    .on_rollback({
      let view = view.clone();
      move |previous, _err| view.set_points(target, previous)
    })
    .on_error(move |err| view.sync_error(err));

    self.inner.optimistic.execute(&key, op).await
  }

  /// Hand a point change to the batcher. The receiver resolves with the
  /// server's update for the change's target.
  ///
  /// A change arriving while no batch window is open goes out on the next
  /// scheduler turn (leading edge) and opens a window. Changes arriving while
  /// the window is open wait for it to close; each one pushes the close back
  /// by the debounce delay, and whatever gathered is sent as one request.
  ///
  /// Offline, the change goes straight to the durable queue before this
  /// returns.
  pub fn submit(&self, item: PendingBatchItem) -> oneshot::Receiver<Result<ItemUpdate>> {
    let (tx, rx) = oneshot::channel();

    if !self.is_online() {
      self.demote(vec![PendingEntry {
        item,
        waiter: Some(tx),
      }]);
      return rx;
    }

    let mut state = self.lock_batch();
    debug!(item = %item.target(), delta = item.delta, "change added to batch");
    state.pending.push_back(PendingEntry {
      item,
      waiter: Some(tx),
    });

    let leading = match state.timer.take() {
      Some(timer) => {
        timer.abort();
        false
      }
      None => self.inner.settings.leading_edge,
    };
    state.window += 1;
    let window = state.window;
    let this = self.clone();
    let delay = self.inner.settings.debounce();
    state.timer = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      this.close_window(window);
    }));
    drop(state);

    if leading {
      self.spawn_flush();
    }

    rx
  }

  fn close_window(&self, window: u64) {
    let mut state = self.lock_batch();
    if state.window != window {
      return;
    }
    state.timer = None;
    drop(state);
    // Detached so a later timer reset never cancels a started request
    self.spawn_flush();
  }

  fn spawn_flush(&self) {
    let this = self.clone();
    tokio::spawn(async move {
      if let Err(e) = this.flush().await {
        debug!(error = %e, "background flush failed");
      }
    });
  }

  /// Send everything in the batch window as one request. Returns how many
  /// changes the server accepted.
  pub async fn flush(&self) -> Result<usize> {
    let _flushing = self.inner.flush_lock.lock().await;

    let entries: Vec<PendingEntry> = self.lock_batch().pending.drain(..).collect();
    if entries.is_empty() {
      return Ok(0);
    }

    // Older queued changes must reach the server first
    if !self.is_online() || !self.inner.queue.is_empty() {
      debug!(count = entries.len(), "routing batch through the offline queue");
      self.demote(entries);
      if self.is_online() {
        return self.drain_offline().await;
      }
      return Ok(0);
    }

    let requests: Vec<BatchRequestItem> = entries.iter().map(|e| e.item.to_request_item()).collect();
    let result = {
      let _syncing = self.begin_request();
      self.inner.transport.send_batch(&requests).await
    };

    match result {
      Ok(response) => {
        let count = entries.len();
        let settled: Vec<(Target, Option<Waiter>)> = entries
          .into_iter()
          .map(|e| (e.item.target(), e.waiter))
          .collect();
        self.deliver(settled, &response);
        self.invalidate_points_group();
        info!(count, "point batch synced");
        Ok(count)
      }
      Err(err) if !self.is_online() => {
        warn!(error = %err, "batch failed after going offline, queueing it");
        self.demote(entries);
        Err(err)
      }
      Err(err) if err.is_retryable() => {
        error!(count = entries.len(), error = %err, "point batch failed, will retry on next flush");
        self.push_back(entries, &err);
        Err(err)
      }
      Err(err) => {
        error!(count = entries.len(), error = %err, "point batch refused, dropping it");
        self.fail_entries(entries, &err);
        Err(err)
      }
    }
  }

  /// Fail every waiter with `err` and hand back the bare items. The view
  /// hears about the error when no waiter took it.
  fn fail_entries(&self, entries: Vec<PendingEntry>, err: &SyncError) -> Vec<PendingBatchItem> {
    let mut unannounced = false;
    let items: Vec<PendingBatchItem> = entries
      .into_iter()
      .map(|entry| {
        let announced = match entry.waiter {
          Some(waiter) => waiter.send(Err(err.clone())).is_ok(),
          None => false,
        };
        unannounced |= !announced;
        entry.item
      })
      .collect();

    if unannounced {
      self.inner.view.sync_error(err);
    }
    items
  }

  /// Failed items return to the front of the batch, in order. Their
  /// optimistic operations roll back now; a retry lands in the view
  /// directly.
  fn push_back(&self, entries: Vec<PendingEntry>, err: &SyncError) {
    let items = self.fail_entries(entries, err);
    let mut state = self.lock_batch();
    for item in items.into_iter().rev() {
      state.pending.push_front(PendingEntry { item, waiter: None });
    }
  }

  /// Move batch entries into the durable queue one by one. Their waiters
  /// stay pending until a drain settles them.
  fn demote(&self, entries: Vec<PendingEntry>) {
    for entry in entries {
      match self
        .inner
        .queue
        .enqueue(UPDATE_POINTS_ACTION, &entry.item.to_request_item())
      {
        Ok(queued) => {
          if let Some(waiter) = entry.waiter {
            self.lock_batch().offline_waiters.insert(queued.id, waiter);
          }
        }
        Err(e) => {
          error!(item = %entry.item.target(), error = %e, "could not queue change offline");
          match entry.waiter {
            Some(waiter) => {
              let _ = waiter.send(Err(e));
            }
            None => self.inner.view.sync_error(&e),
          }
        }
      }
    }
  }

  /// Hand each waiter its target's update; updates nobody is waiting for go
  /// straight to the view.
  fn deliver(&self, settled: Vec<(Target, Option<Waiter>)>, response: &BatchResponse) {
    let mut covered = HashSet::new();
    for (target, waiter) in settled {
      let Some(waiter) = waiter else {
        continue;
      };
      match response.update_for(target) {
        Some(update) => {
          if waiter.send(Ok(update.clone())).is_ok() {
            covered.insert(target);
          }
        }
        None => {
          warn!(item = %target, "server returned no result for change");
          let _ = waiter.send(Err(SyncError::rejected(
            None,
            format!("no result for {}", target),
          )));
        }
      }
    }

    for update in &response.updates {
      if !covered.contains(&update.target()) {
        apply_update(self.inner.view.as_ref(), update);
      }
    }
  }

  fn invalidate_points_group(&self) {
    let group = &self.inner.settings.points_group;
    if let Err(e) = self.inner.cache.invalidate_group(&GroupSelector::named(group.as_str())) {
      warn!(group = %group, error = %e, "could not invalidate points cache");
    }
  }

  /// Queue a mutation for later replay, whatever the connectivity.
  pub fn enqueue_offline<P: Serialize + ?Sized>(&self, action: &str, payload: &P) -> Result<QueuedMutation> {
    self.inner.queue.enqueue(action, payload)
  }

  /// Send a non-point mutation now, or queue it when that is not possible.
  ///
  /// Returns the server answer, or `None` when the mutation was queued.
  /// Rejections are returned as errors and not queued.
  pub async fn send_or_queue(&self, action: &str, payload: &Value) -> Result<Option<Value>> {
    if !self.is_online() || !self.inner.queue.is_empty() {
      self.inner.queue.enqueue(action, payload)?;
      return Ok(None);
    }

    match self.inner.transport.send_mutation(action, payload).await {
      Ok(answer) => Ok(Some(answer)),
      Err(e) if e.is_retryable() => {
        warn!(action, error = %e, "mutation failed, queueing it");
        self.inner.queue.enqueue(action, payload)?;
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }

  /// Replay the offline queue in FIFO order. Returns how many queued
  /// mutations were sent.
  ///
  /// The queue is trimmed only when every replayed request succeeded or was
  /// refused for good; refused items are removed on the spot. On a retryable
  /// failure all of it stays queued, including items the server may already
  /// have applied.
  pub async fn drain_offline(&self) -> Result<usize> {
    let _draining = self.inner.drain_lock.lock().await;

    if !self.is_online() {
      debug!("offline, skipping queue drain");
      return Ok(0);
    }

    let items = self.inner.queue.drain_all();
    let Some(last) = items.last().map(|m| m.id) else {
      return Ok(0);
    };

    info!(count = items.len(), "replaying offline queue");
    let result = {
      let _syncing = self.begin_request();
      self.replay(&items).await
    };

    match result {
      Ok(applied) => {
        self.inner.queue.clear_through(last)?;
        info!(count = applied, "offline queue replayed");
        Ok(applied)
      }
      Err(err) => {
        error!(error = %err, "offline replay failed, queue kept for the next attempt");
        if self.is_online() {
          let ids: Vec<u64> = items.iter().map(|m| m.id).collect();
          self.fail_offline_waiters(&ids, &err);
        }
        Err(err)
      }
    }
  }

  /// Returns how many queued mutations the server applied.
  async fn replay(&self, items: &[QueuedMutation]) -> Result<usize> {
    let mut applied = 0;
    for run in replay_runs(items) {
      match run {
        ReplayRun::Points(run) => {
          let mut ids = Vec::with_capacity(run.len());
          let mut requests = Vec::with_capacity(run.len());
          for queued in run {
            match serde_json::from_value::<BatchRequestItem>(queued.payload.clone()) {
              Ok(request) => {
                ids.push(queued.id);
                requests.push(request);
              }
              Err(e) => warn!(id = queued.id, error = %e, "unreadable queued point change, dropping"),
            }
          }
          if requests.is_empty() {
            continue;
          }

          let response = match self.inner.transport.send_batch(&requests).await {
            Ok(response) => response,
            Err(err) if err.is_retryable() => return Err(err),
            Err(err) => {
              warn!(count = ids.len(), error = %err, "server refused queued point changes, dropping them");
              self.drop_refused(&ids, &err)?;
              continue;
            }
          };
          let settled: Vec<(Target, Option<Waiter>)> = {
            let mut state = self.lock_batch();
            ids
              .iter()
              .zip(&requests)
              .map(|(id, request)| (request.target(), state.offline_waiters.remove(id)))
              .collect()
          };
          self.deliver(settled, &response);
          self.invalidate_points_group();
          applied += ids.len();
        }
        ReplayRun::Other(queued) => {
          match self
            .inner
            .transport
            .send_mutation(&queued.action, &queued.payload)
            .await
          {
            Ok(_) => applied += 1,
            Err(err) if err.is_retryable() => return Err(err),
            Err(err) => {
              warn!(id = queued.id, action = %queued.action, error = %err, "server refused queued mutation, dropping it");
              self.drop_refused(&[queued.id], &err)?;
            }
          }
        }
      }
    }
    Ok(applied)
  }

  /// Take items the server refused out of the queue and fail their waiters.
  fn drop_refused(&self, ids: &[u64], err: &SyncError) -> Result<()> {
    self.inner.queue.remove(ids)?;
    self.fail_offline_waiters(ids, err);
    Ok(())
  }

  fn fail_offline_waiters(&self, ids: &[u64], err: &SyncError) {
    let waiters: Vec<Waiter> = {
      let mut state = self.lock_batch();
      ids
        .iter()
        .filter_map(|id| state.offline_waiters.remove(id))
        .collect()
    };
    if waiters.is_empty() {
      self.inner.view.sync_error(err);
    }
    for waiter in waiters {
      let _ = waiter.send(Err(err.clone()));
    }
  }

  /// Periodic housekeeping: drop expired cache entries and push out anything
  /// left behind by earlier failures.
  pub async fn refresh(&self) -> Result<()> {
    match self.inner.cache.purge_expired() {
      Ok(0) => {}
      Ok(purged) => debug!(purged, "expired cache entries removed"),
      Err(e) => warn!(error = %e, "could not purge expired cache entries"),
    }
    self.drain_offline().await?;
    self.flush().await?;
    Ok(())
  }

  /// Drive the coordinator from bridge triggers and the refresh timer until
  /// the trigger channel closes. Refresh is skipped while offline or dormant.
  pub async fn run(
    self,
    mut triggers: mpsc::UnboundedReceiver<SyncTrigger>,
    app_state: watch::Receiver<AppState>,
  ) {
    let mut refresh = tokio::time::interval(self.inner.settings.refresh_interval());
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    refresh.tick().await;

    loop {
      tokio::select! {
        trigger = triggers.recv() => {
          let Some(trigger) = trigger else {
            debug!("trigger channel closed, sync loop stopping");
            break;
          };
          let outcome = match trigger {
            SyncTrigger::Drain => match self.drain_offline().await {
              Ok(replayed) => self.flush().await.map(|flushed| replayed + flushed),
              Err(e) => Err(e),
            },
            SyncTrigger::Online => self.set_online(true).await,
            SyncTrigger::Offline => self.set_online(false).await,
          };
          if let Err(e) = outcome {
            warn!(?trigger, error = %e, "sync trigger failed");
          }
        }
        _ = refresh.tick() => {
          if !self.is_online() || *app_state.borrow() == AppState::Dormant {
            continue;
          }
          if let Err(e) = self.refresh().await {
            warn!(error = %e, "periodic refresh failed");
          }
        }
      }
    }
  }
}
