//! Cache entry types and read-result metadata.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long a cache entry stays readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
  Finite(Duration),
  Infinite,
}

impl Ttl {
  pub fn millis(ms: u64) -> Self {
    Ttl::Finite(Duration::from_millis(ms))
  }

  pub fn minutes(minutes: u64) -> Self {
    Ttl::Finite(Duration::from_secs(minutes * 60))
  }

  fn as_millis(&self) -> Option<u64> {
    match self {
      Ttl::Finite(d) => Some(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
      Ttl::Infinite => None,
    }
  }

  fn from_millis(ms: Option<u64>) -> Self {
    match ms {
      Some(ms) => Ttl::millis(ms),
      None => Ttl::Infinite,
    }
  }
}

/// A decoded cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub key: String,
  pub value: T,
  pub stored_at: DateTime<Utc>,
  pub ttl: Ttl,
}

impl<T> CacheEntry<T> {
  /// Readable while `now - stored_at < ttl`.
  pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
    match self.ttl {
      Ttl::Infinite => true,
      Ttl::Finite(ttl) => {
        let age = now - self.stored_at;
        match age.to_std() {
          Ok(age) => age < ttl,
          // Stored "in the future" (clock moved back)
          Err(_) => true,
        }
      }
    }
  }
}

/// On-disk shape of a cache entry.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredEntry {
  pub value: serde_json::Value,
  /// Milliseconds since the Unix epoch
  pub stored_at: i64,
  /// `None` means the entry never expires
  pub ttl_ms: Option<u64>,
}

impl StoredEntry {
  pub fn new(value: serde_json::Value, stored_at: DateTime<Utc>, ttl: Ttl) -> Self {
    Self {
      value,
      stored_at: stored_at.timestamp_millis(),
      ttl_ms: ttl.as_millis(),
    }
  }

  pub fn stored_at(&self) -> DateTime<Utc> {
    Utc
      .timestamp_millis_opt(self.stored_at)
      .single()
      .unwrap_or(DateTime::<Utc>::MIN_UTC)
  }

  pub fn ttl(&self) -> Ttl {
    Ttl::from_millis(self.ttl_ms)
  }
}

/// Result from a read-through cache lookup, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Expired entry served because the network was unavailable.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still within its TTL
  CacheFresh,
  /// Offline mode: network unavailable, serving an expired entry
  Offline,
}
