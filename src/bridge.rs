//! Message relay between the app and its background worker.
//!
//! Wire format, one JSON object per message:
//!
//! | direction     | message                                          |
//! |---------------|--------------------------------------------------|
//! | worker → app  | `{"type": "cacheProgress", "progress": 0..100}`  |
//! | worker → app  | `{"type": "sync-data"}`                          |
//! | app → worker  | `{"action": "appState", "state": "active"}`      |
//! | app → worker  | `{"action": "skipWaiting"}`                      |
//!
//! Every message is fire-and-forget.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// What the bridge asks of the sync coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  /// Replay the offline queue
  Drain,
  Online,
  Offline,
}

/// Whether the user is around. Periodic refresh pauses while dormant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
  Active,
  Dormant,
}

/// Worker to app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
  /// Bulk pre-caching progress in percent
  #[serde(rename = "cacheProgress")]
  CacheProgress { progress: f64 },
  /// Push notification asking for a resync
  #[serde(rename = "sync-data")]
  SyncData,
}

/// App to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum PageCommand {
  #[serde(rename = "appState")]
  AppState { state: AppState },
  /// Activate a waiting worker update
  #[serde(rename = "skipWaiting")]
  SkipWaiting,
}

/// Outbound half of the worker channel.
pub trait WorkerPort: Send + Sync {
  fn post(&self, command: PageCommand) -> Result<()>;
}

/// Port over an unbounded tokio channel.
pub struct ChannelPort {
  tx: mpsc::UnboundedSender<PageCommand>,
}

impl ChannelPort {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<PageCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl WorkerPort for ChannelPort {
  fn post(&self, command: PageCommand) -> Result<()> {
    self
      .tx
      .send(command)
      .map_err(|_| SyncError::network("background worker is gone"))
  }
}

pub struct BackgroundBridge {
  port: Arc<dyn WorkerPort>,
  /// Unbounded so a connectivity change is never lost to a full channel
  triggers: mpsc::UnboundedSender<SyncTrigger>,
  progress: watch::Sender<u8>,
  app_state: watch::Sender<AppState>,
  /// Zero disables dormancy
  idle_timeout: Duration,
  last_activity: Mutex<Instant>,
}

impl BackgroundBridge {
  pub fn new(
    port: Arc<dyn WorkerPort>,
    triggers: mpsc::UnboundedSender<SyncTrigger>,
    idle_timeout: Duration,
  ) -> Self {
    let (progress, _) = watch::channel(0);
    let (app_state, _) = watch::channel(AppState::Active);
    Self {
      port,
      triggers,
      progress,
      app_state,
      idle_timeout,
      last_activity: Mutex::new(Instant::now()),
    }
  }

  /// Latest pre-caching progress, 0 to 100.
  pub fn progress(&self) -> watch::Receiver<u8> {
    self.progress.subscribe()
  }

  pub fn app_state(&self) -> AppState {
    *self.app_state.borrow()
  }

  pub fn app_state_receiver(&self) -> watch::Receiver<AppState> {
    self.app_state.subscribe()
  }

  fn post(&self, command: PageCommand) {
    if let Err(e) = self.post_checked(command) {
      warn!(error = %e, "could not reach background worker");
    }
  }

  fn post_checked(&self, command: PageCommand) -> Result<()> {
    debug!(?command, "message to background worker");
    self.port.post(command)
  }

  fn trigger(&self, trigger: SyncTrigger) {
    if self.triggers.send(trigger).is_err() {
      warn!(?trigger, "sync loop has stopped, trigger dropped");
    }
  }

  /// Announce a new app state. Returns false when nothing changed.
  pub fn set_app_state(&self, state: AppState) -> bool {
    if self.app_state.send_replace(state) == state {
      return false;
    }
    info!(?state, "app state changed");
    self.post(PageCommand::AppState { state });
    true
  }

  /// Tell a waiting worker update to take over.
  pub fn skip_waiting(&self) {
    self.post(PageCommand::SkipWaiting);
  }

  /// Handle one raw message from the worker.
  pub fn handle_message(&self, raw: &str) -> Result<()> {
    let event: WorkerEvent = serde_json::from_str(raw)?;
    self.handle_event(event);
    Ok(())
  }

  pub fn handle_event(&self, event: WorkerEvent) {
    match event {
      WorkerEvent::CacheProgress { progress } => {
        let percent = if progress.is_finite() {
          progress.clamp(0.0, 100.0).round() as u8
        } else {
          0
        };
        self.progress.send_replace(percent);
      }
      WorkerEvent::SyncData => {
        debug!("worker requested a resync");
        self.trigger(SyncTrigger::Drain);
      }
    }
  }

  pub fn user_logged_in(&self) {
    self.record_activity();
    self.trigger(SyncTrigger::Drain);
  }

  pub fn came_online(&self) {
    self.trigger(SyncTrigger::Online);
  }

  pub fn went_offline(&self) {
    self.trigger(SyncTrigger::Offline);
  }

  /// Note user interaction; wakes a dormant app.
  pub fn record_activity(&self) {
    *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    self.set_app_state(AppState::Active);
  }

  fn idle_deadline(&self) -> Instant {
    *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) + self.idle_timeout
  }

  /// Go dormant when the idle timeout has passed since the last activity.
  pub fn check_idle(&self) -> AppState {
    if !self.idle_timeout.is_zero() && Instant::now() >= self.idle_deadline() {
      self.set_app_state(AppState::Dormant);
    }
    self.app_state()
  }

  /// Switch to dormant after each idle stretch, for as long as the bridge
  /// lives.
  pub async fn watch_idle(&self) {
    if self.idle_timeout.is_zero() {
      return;
    }

    let mut state = self.app_state.subscribe();
    loop {
      tokio::time::sleep_until(self.idle_deadline()).await;
      if self.check_idle() != AppState::Dormant {
        continue;
      }
      while *state.borrow_and_update() == AppState::Dormant {
        if state.changed().await.is_err() {
          return;
        }
      }
    }
  }
}
