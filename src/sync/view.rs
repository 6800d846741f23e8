//! Displayed point totals the coordinator corrects after each flush.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::batch::{ItemUpdate, Target};
use crate::error::SyncError;

/// Whatever renders point totals.
pub trait PointsView: Send + Sync {
  /// Currently displayed total.
  fn points(&self, target: Target) -> i64;

  fn set_points(&self, target: Target, total: i64);

  /// A recoverable sync failure worth telling the user about.
  fn sync_error(&self, _error: &SyncError) {}
}

/// Apply an authoritative server update, including member totals carried by
/// a group update.
pub fn apply_update(view: &dyn PointsView, update: &ItemUpdate) {
  view.set_points(update.target(), update.total_points);
  if let Some(members) = &update.member_totals {
    for (member, total) in members {
      view.set_points(Target::individual(*member), *total);
    }
  }
}

/// In-memory view, used by the CLI and in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryPointsView {
  totals: Arc<Mutex<HashMap<Target, i64>>>,
  errors: Arc<Mutex<Vec<SyncError>>>,
}

impl MemoryPointsView {
  pub fn new() -> Self {
    Self::default()
  }

  /// Errors reported so far, oldest first.
  pub fn errors(&self) -> Vec<SyncError> {
    self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }
}

impl PointsView for MemoryPointsView {
  fn points(&self, target: Target) -> i64 {
    self
      .totals
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .get(&target)
      .copied()
      .unwrap_or(0)
  }

  fn set_points(&self, target: Target, total: i64) {
    self
      .totals
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(target, total);
  }

  fn sync_error(&self, error: &SyncError) {
    self
      .errors
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(error.clone());
  }
}
