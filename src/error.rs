//! Error taxonomy shared by every layer of the sync engine.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures the sync engine reports to its callers.
///
/// `Clone` so a single batch failure can be handed to every operation waiting
/// on that batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
  /// The durable store could not be opened or written.
  #[error("storage unavailable: {reason}")]
  StorageUnavailable { reason: String },

  /// The request never completed (connection refused, timeout, DNS, ...).
  #[error("network failure: {reason}")]
  NetworkFailure { reason: String },

  /// The server answered, but said no.
  #[error("server rejected request: {message}")]
  ServerRejected {
    /// HTTP status when the rejection came from the transport layer
    status: Option<u16>,
    message: String,
  },

  /// The response body did not match any known shape.
  #[error("malformed response: {reason}")]
  MalformedResponse { reason: String },

  /// Another optimistic operation with the same key is still pending.
  #[error("update '{key}' is already in flight")]
  UpdateInFlight { key: String },

  #[error("serialization error: {0}")]
  Serialization(String),
}

impl SyncError {
  pub fn storage(reason: impl Into<String>) -> Self {
    Self::StorageUnavailable {
      reason: reason.into(),
    }
  }

  pub fn network(reason: impl Into<String>) -> Self {
    Self::NetworkFailure {
      reason: reason.into(),
    }
  }

  pub fn rejected(status: Option<u16>, message: impl Into<String>) -> Self {
    Self::ServerRejected {
      status,
      message: message.into(),
    }
  }

  pub fn malformed(reason: impl Into<String>) -> Self {
    Self::MalformedResponse {
      reason: reason.into(),
    }
  }

  /// Whether an automatic retry may help.
  ///
  /// A malformed body is treated like a dropped connection since it usually
  /// means a proxy or a half-deployed server sat in the way. So is a 5xx
  /// answer. Any other rejection is final.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::NetworkFailure { .. } | Self::MalformedResponse { .. } => true,
      Self::ServerRejected {
        status: Some(status),
        ..
      } => *status >= 500,
      _ => false,
    }
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(err: rusqlite::Error) -> Self {
    Self::storage(err.to_string())
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(err: serde_json::Error) -> Self {
    Self::Serialization(err.to_string())
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_decode() {
      Self::malformed(err.to_string())
    } else if let Some(status) = err.status() {
      Self::rejected(Some(status.as_u16()), err.to_string())
    } else {
      Self::network(err.to_string())
    }
  }
}
