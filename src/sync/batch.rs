//! Batch items, the outbound wire format, and response normalization.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, SyncError};

/// Whether points go to a patrol/group or a single participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
  Group,
  Individual,
}

impl fmt::Display for TargetKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Group => write!(f, "group"),
      Self::Individual => write!(f, "individual"),
    }
  }
}

/// Something that carries a points total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
  pub kind: TargetKind,
  pub id: i64,
}

impl Target {
  pub fn group(id: i64) -> Self {
    Self {
      kind: TargetKind::Group,
      id,
    }
  }

  pub fn individual(id: i64) -> Self {
    Self {
      kind: TargetKind::Individual,
      id,
    }
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.kind, self.id)
  }
}

/// A point change waiting in the batch window.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatchItem {
  pub kind: TargetKind,
  pub target_id: i64,
  pub delta: i64,
  pub timestamp: DateTime<Utc>,
  /// Meeting date the points belong to, when not today
  pub context_date: Option<NaiveDate>,
}

impl PendingBatchItem {
  pub fn new(target: Target, delta: i64) -> Self {
    Self {
      kind: target.kind,
      target_id: target.id,
      delta,
      timestamp: Utc::now(),
      context_date: None,
    }
  }

  pub fn individual(id: i64, delta: i64) -> Self {
    Self::new(Target::individual(id), delta)
  }

  pub fn group(id: i64, delta: i64) -> Self {
    Self::new(Target::group(id), delta)
  }

  pub fn with_date(mut self, date: NaiveDate) -> Self {
    self.context_date = Some(date);
    self
  }

  pub fn target(&self) -> Target {
    Target {
      kind: self.kind,
      id: self.target_id,
    }
  }

  /// Unique per target, action and timestamp so distinct taps never share a
  /// key, while a replay of the same tap does.
  pub fn update_key(&self) -> String {
    format!(
      "points:{}:{}:{}",
      self.kind,
      self.target_id,
      self.timestamp.timestamp_millis()
    )
  }

  pub fn to_request_item(&self) -> BatchRequestItem {
    BatchRequestItem {
      kind: self.kind,
      id: self.target_id,
      points: self.delta,
      timestamp: self.timestamp,
      date: self.context_date,
    }
  }
}

/// One element of the outbound batch body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequestItem {
  #[serde(rename = "type")]
  pub kind: TargetKind,
  pub id: i64,
  pub points: i64,
  pub timestamp: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub date: Option<NaiveDate>,
}

impl BatchRequestItem {
  pub fn target(&self) -> Target {
    Target {
      kind: self.kind,
      id: self.id,
    }
  }
}

/// Authoritative totals the server reports for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUpdate {
  #[serde(rename = "type")]
  pub kind: TargetKind,
  pub id: i64,
  pub total_points: i64,
  /// Members whose totals moved along with a group
  #[serde(default)]
  pub member_ids: Option<Vec<i64>>,
  /// New totals keyed by member id
  #[serde(default)]
  pub member_totals: Option<BTreeMap<i64, i64>>,
  #[serde(default)]
  pub skipped_count: Option<u32>,
}

impl ItemUpdate {
  pub fn target(&self) -> Target {
    Target {
      kind: self.kind,
      id: self.id,
    }
  }
}

/// A successful batch response after normalization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchResponse {
  pub updates: Vec<ItemUpdate>,
  pub message: Option<String>,
}

/// Response layouts the server has been seen to use, in the order they are
/// tried.
#[derive(Debug, Clone, Copy)]
enum ResponseShape {
  /// `{status, updates, message}`
  Flat,
  /// `{status?, data: {updates}}`
  DataNested,
}

const RESPONSE_SHAPES: [ResponseShape; 2] = [ResponseShape::Flat, ResponseShape::DataNested];

impl BatchResponse {
  /// Latest update reported for a target.
  pub fn update_for(&self, target: Target) -> Option<&ItemUpdate> {
    self.updates.iter().rev().find(|u| u.target() == target)
  }

  /// Normalize a decoded JSON body.
  ///
  /// A body flagged as an error (`status: "error"` or `success: false`, at
  /// the top level or under `data`) becomes `ServerRejected`; a body matching
  /// none of the known shapes becomes `MalformedResponse`.
  pub fn normalize(body: Value) -> Result<Self> {
    let obj = body
      .as_object()
      .ok_or_else(|| SyncError::malformed("response is not a JSON object"))?;

    let data = obj.get("data").and_then(Value::as_object);
    let message = obj
      .get("message")
      .or_else(|| data.and_then(|d| d.get("message")))
      .and_then(Value::as_str)
      .map(String::from);

    for scope in std::iter::once(obj).chain(data) {
      match scope.get("status").and_then(Value::as_str) {
        Some("error") => {
          return Err(SyncError::rejected(
            None,
            message.unwrap_or_else(|| "server reported an error".to_string()),
          ));
        }
        Some("success") | None => {}
        Some(other) => {
          return Err(SyncError::malformed(format!("unknown status '{}'", other)));
        }
      }
      if scope.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(SyncError::rejected(
          None,
          message.unwrap_or_else(|| "server reported an error".to_string()),
        ));
      }
    }

    for shape in RESPONSE_SHAPES {
      let updates = match shape {
        ResponseShape::Flat => obj.get("updates"),
        ResponseShape::DataNested => data.and_then(|d| d.get("updates")),
      };

      if let Some(updates) = updates {
        let updates: Vec<ItemUpdate> = serde_json::from_value(updates.clone()).map_err(|e| {
          SyncError::malformed(format!("bad updates array ({:?} shape): {}", shape, e))
        })?;
        return Ok(Self { updates, message });
      }
    }

    Err(SyncError::malformed("response has no updates array"))
  }
}

/// SHA-256 of a request body, hex encoded. Lets the server spot an exact
/// replay of a batch it already applied.
pub fn fingerprint(body: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(body);
  hex::encode(hasher.finalize())
}
