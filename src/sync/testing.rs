//! Scripted remote used by coordinator tests.

use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use super::batch::{BatchRequestItem, BatchResponse, ItemUpdate, Target};
use super::transport::BatchTransport;
use crate::error::{Result, SyncError};

/// A request the scripted remote received.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Sent {
  Batch(Vec<BatchRequestItem>),
  Mutation(String, Value),
}

/// Keeps running totals like the real server and fails on demand.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
  totals: Mutex<HashMap<Target, i64>>,
  /// One entry per upcoming request; `None` lets it through
  script: Mutex<VecDeque<Option<SyncError>>>,
  /// Batches touching one of these are refused with the given error
  refused: Mutex<HashMap<Target, SyncError>>,
  sent: Mutex<Vec<Sent>>,
}

impl ScriptedTransport {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn set_total(&self, target: Target, total: i64) {
    self.totals.lock().unwrap().insert(target, total);
  }

  /// The next request fails with `err` and changes nothing.
  pub(crate) fn fail_next(&self, err: SyncError) {
    self.script.lock().unwrap().push_back(Some(err));
  }

  /// The next request goes through, so a later `fail_next` hits the one
  /// after it.
  pub(crate) fn pass_next(&self) {
    self.script.lock().unwrap().push_back(None);
  }

  /// Every batch containing `target` is refused with `err`.
  pub(crate) fn refuse(&self, target: Target, err: SyncError) {
    self.refused.lock().unwrap().insert(target, err);
  }

  fn scripted_failure(&self) -> Option<SyncError> {
    self.script.lock().unwrap().pop_front().flatten()
  }

  pub(crate) fn sent(&self) -> Vec<Sent> {
    self.sent.lock().unwrap().clone()
  }

  pub(crate) fn batches(&self) -> Vec<Vec<BatchRequestItem>> {
    self
      .sent()
      .into_iter()
      .filter_map(|s| match s {
        Sent::Batch(items) => Some(items),
        Sent::Mutation(..) => None,
      })
      .collect()
  }
}

impl BatchTransport for ScriptedTransport {
  fn send_batch<'a>(&'a self, items: &'a [BatchRequestItem]) -> BoxFuture<'a, Result<BatchResponse>> {
    Box::pin(async move {
      self.sent.lock().unwrap().push(Sent::Batch(items.to_vec()));
      if let Some(err) = self.scripted_failure() {
        return Err(err);
      }
      let targets: HashSet<Target> = items.iter().map(|i| i.target()).collect();
      if let Some(err) = self
        .refused
        .lock()
        .unwrap()
        .iter()
        .find(|(target, _)| targets.contains(*target))
        .map(|(_, err)| err.clone())
      {
        return Err(err);
      }

      let mut totals = self.totals.lock().unwrap();
      let updates = items
        .iter()
        .map(|item| {
          let total = totals.entry(item.target()).or_insert(0);
          *total += item.points;
          ItemUpdate {
            kind: item.kind,
            id: item.id,
            total_points: *total,
            member_ids: None,
            member_totals: None,
            skipped_count: None,
          }
        })
        .collect();

      Ok(BatchResponse {
        updates,
        message: None,
      })
    })
  }

  fn send_mutation<'a>(&'a self, action: &'a str, payload: &'a Value) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
      self
        .sent
        .lock()
        .unwrap()
        .push(Sent::Mutation(action.to_string(), payload.clone()));
      if let Some(err) = self.scripted_failure() {
        return Err(err);
      }
      Ok(json!({"success": true}))
    })
  }
}
