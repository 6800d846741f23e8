//! Outbound requests for point batches and replayed mutations.

use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::batch::{fingerprint, BatchRequestItem, BatchResponse};
use crate::config::ServerConfig;
use crate::error::{Result, SyncError};

/// Header carrying the SHA-256 of the batch body.
pub const FINGERPRINT_HEADER: &str = "X-Batch-Fingerprint";

/// Remote side of the sync engine.
pub trait BatchTransport: Send + Sync {
  /// Send one batch of point changes in a single request.
  fn send_batch<'a>(&'a self, items: &'a [BatchRequestItem]) -> BoxFuture<'a, Result<BatchResponse>>;

  /// Replay a queued action other than a point change.
  fn send_mutation<'a>(&'a self, action: &'a str, payload: &'a Value) -> BoxFuture<'a, Result<Value>>;
}

/// Transport speaking JSON over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base: Url,
  batch_url: Url,
  mutation_prefix: String,
}

impl HttpTransport {
  pub fn new(base: Url, batch_endpoint: &str, mutation_prefix: &str, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("troopsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| SyncError::network(format!("failed to build HTTP client: {}", e)))?;

    let batch_url = base
      .join(batch_endpoint)
      .map_err(|e| SyncError::network(format!("invalid batch endpoint '{}': {}", batch_endpoint, e)))?;

    Ok(Self {
      client,
      base,
      batch_url,
      mutation_prefix: mutation_prefix.to_string(),
    })
  }

  pub fn from_config(config: &ServerConfig) -> color_eyre::Result<Self> {
    let base = config.base_url()?;
    Ok(Self::new(
      base,
      &config.batch_endpoint,
      &config.mutation_prefix,
      config.request_timeout(),
    )?)
  }

  pub fn batch_url(&self) -> &Url {
    &self.batch_url
  }

  fn mutation_url(&self, action: &str) -> Result<Url> {
    let path = format!("{}{}", self.mutation_prefix, action);
    self
      .base
      .join(&path)
      .map_err(|e| SyncError::network(format!("invalid mutation path '{}': {}", path, e)))
  }

  /// POST a JSON body and decode the JSON answer. Non-2xx statuses become
  /// `ServerRejected`, undecodable bodies `MalformedResponse`.
  async fn post_json(&self, url: Url, body: Vec<u8>, batch: bool) -> Result<Value> {
    let mut request = self
      .client
      .post(url.clone())
      .header(CONTENT_TYPE, "application/json");
    if batch {
      request = request.header(FINGERPRINT_HEADER, fingerprint(&body));
    }

    let response = request.body(body).send().await?;
    let status = response.status();
    let bytes = response.bytes().await?;

    if !status.is_success() {
      let message = rejection_message(&bytes)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
      debug!(%url, status = status.as_u16(), "request rejected");
      return Err(SyncError::rejected(Some(status.as_u16()), message));
    }

    serde_json::from_slice(&bytes)
      .map_err(|e| SyncError::malformed(format!("response from {} is not JSON: {}", url, e)))
  }
}

/// The `message` field of an error body, when it has one.
fn rejection_message(body: &[u8]) -> Option<String> {
  let value: Value = serde_json::from_slice(body).ok()?;
  value
    .get("message")
    .and_then(Value::as_str)
    .map(String::from)
}

impl BatchTransport for HttpTransport {
  fn send_batch<'a>(&'a self, items: &'a [BatchRequestItem]) -> BoxFuture<'a, Result<BatchResponse>> {
    Box::pin(async move {
      let body = serde_json::to_vec(items)?;
      debug!(items = items.len(), url = %self.batch_url, "sending point batch");
      let value = self.post_json(self.batch_url.clone(), body, true).await?;
      BatchResponse::normalize(value)
    })
  }

  fn send_mutation<'a>(&'a self, action: &'a str, payload: &'a Value) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
      let url = self.mutation_url(action)?;
      let body = serde_json::to_vec(payload)?;
      debug!(action, %url, "replaying queued mutation");
      self.post_json(url, body, false).await
    })
  }
}
