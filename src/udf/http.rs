//! # HTTP Handler Clients
//!
//! Clients for a transformation handler served over HTTP/1.1:
//!
//! | Endpoint          | Shape                                              |
//! |-------------------|----------------------------------------------------|
//! | `GET /ready`      | any 2xx means ready                                |
//! | `POST /map`       | JSON request, JSON `{"results": [..]}` response    |
//! | `POST /mapstream` | JSON request, one JSON result per response line    |
//!
//! Payload values travel base64-encoded. Response bodies (and single lines of
//! a streamed response) larger than the configured maximum message size are
//! rejected.

use super::{
  HealthChecker, MapApplier, MapStreamApplier, READINESS_POLL_INTERVAL, UdfClientFactory,
  wait_until_healthy,
};
use crate::config::RuntimeSettings;
use crate::error::{Error, Result};
use crate::message::{Message, ReadMessage};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::{Method, Request, header};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// Request body sent for every record.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapRequest {
  /// Record keys.
  pub keys: Vec<String>,
  /// Base64-encoded payload.
  pub value: String,
  /// Event time, epoch millis.
  pub event_time: i64,
  /// Watermark of the batch, epoch millis.
  pub watermark: i64,
  /// Record id.
  pub id: String,
  /// User headers.
  #[serde(default)]
  pub headers: HashMap<String, String>,
}

/// One record produced by the handler.
#[derive(Debug, Serialize, Deserialize)]
pub struct MapResult {
  /// Output keys.
  #[serde(default)]
  pub keys: Vec<String>,
  /// Base64-encoded payload.
  pub value: String,
  /// Output tags.
  #[serde(default)]
  pub tags: Vec<String>,
}

/// Response body of `POST /map`.
#[derive(Debug, Serialize, Deserialize)]
pub struct MapResponse {
  /// Zero or more output records.
  #[serde(default)]
  pub results: Vec<MapResult>,
}

impl MapRequest {
  /// Builds the request for a read record.
  pub fn from_read_message(read: &ReadMessage) -> Self {
    Self {
      keys: read.message.keys.clone(),
      value: STANDARD.encode(&read.message.value),
      event_time: read.message.event_time.timestamp_millis(),
      watermark: read.watermark.as_millis(),
      id: read.read_offset.to_string(),
      headers: read.message.headers.clone(),
    }
  }
}

impl MapResult {
  /// Turns the `index`-th result for `parent` into an output message. The
  /// output keeps the parent's event time and headers and gets an id derived
  /// from the parent's read offset.
  pub fn into_message(self, parent: &ReadMessage, index: usize) -> Result<Message> {
    let value = STANDARD
      .decode(self.value.as_bytes())
      .map_err(|e| Error::Udf(format!("invalid base64 value in handler result: {}", e)))?;
    let mut message = Message::new(value)
      .with_keys(self.keys)
      .with_tags(self.tags)
      .with_event_time(parent.message.event_time)
      .with_id(format!("{}-{}", parent.read_offset, index));
    message.headers = parent.message.headers.clone();
    Ok(message)
  }
}

/// Removes every complete line from `buf` and returns them without the
/// trailing newline. Blank lines are skipped.
pub fn take_lines(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
  let mut lines = Vec::new();
  while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
    let mut line: Vec<u8> = buf.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
      line.pop();
    }
    if !line.iter().all(u8::is_ascii_whitespace) {
      lines.push(line);
    }
  }
  lines
}

struct Endpoint {
  client: HttpClient,
  base_url: String,
  max_message_size: usize,
  closed: AtomicBool,
}

impl Endpoint {
  fn new(addr: &str, max_message_size: usize) -> Self {
    let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
      addr.trim_end_matches('/').to_string()
    } else {
      format!("http://{}", addr.trim_end_matches('/'))
    };
    Self {
      client: Client::builder(TokioExecutor::new()).build_http(),
      base_url,
      max_message_size,
      closed: AtomicBool::new(false),
    }
  }

  fn ensure_open(&self) -> Result<()> {
    if self.closed.load(Ordering::Acquire) {
      return Err(Error::Udf(format!(
        "connection to {} is closed",
        self.base_url
      )));
    }
    Ok(())
  }

  async fn send(&self, method: Method, path: &str, body: Bytes) -> Result<Incoming> {
    self.ensure_open()?;
    let request = Request::builder()
      .method(method)
      .uri(format!("{}{}", self.base_url, path))
      .header(header::CONTENT_TYPE, "application/json")
      .body(Full::new(body))
      .map_err(|e| Error::Udf(format!("failed to build request: {}", e)))?;
    let response = self
      .client
      .request(request)
      .await
      .map_err(|e| Error::Udf(format!("request to {}{} failed: {}", self.base_url, path, e)))?;
    let status = response.status();
    if !status.is_success() {
      return Err(Error::Udf(format!(
        "{}{} returned {}",
        self.base_url, path, status
      )));
    }
    Ok(response.into_body())
  }

  async fn ready(&self) -> Result<()> {
    self.send(Method::GET, "/ready", Bytes::new()).await?;
    Ok(())
  }

  fn encode(&self, read: &ReadMessage) -> Result<Bytes> {
    let body = serde_json::to_vec(&MapRequest::from_read_message(read))?;
    if body.len() > self.max_message_size {
      return Err(Error::Udf(format!(
        "request of {} bytes exceeds max message size {}",
        body.len(),
        self.max_message_size
      )));
    }
    Ok(Bytes::from(body))
  }

  fn close(&self) {
    self.closed.store(true, Ordering::Release);
  }
}

/// Request/response handler client.
pub struct HttpMapClient {
  endpoint: Endpoint,
}

impl HttpMapClient {
  /// Creates a client for the handler at `addr`.
  pub fn new(addr: &str, max_message_size: usize) -> Self {
    Self {
      endpoint: Endpoint::new(addr, max_message_size),
    }
  }
}

#[async_trait]
impl HealthChecker for HttpMapClient {
  async fn is_healthy(&self) -> Result<()> {
    self.endpoint.ready().await
  }
}

#[async_trait]
impl MapApplier for HttpMapClient {
  async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<()> {
    wait_until_healthy(self, cancel, READINESS_POLL_INTERVAL).await
  }

  async fn apply_map(&self, message: &ReadMessage) -> Result<Vec<Message>> {
    let body = self.endpoint.encode(message)?;
    let incoming = self.endpoint.send(Method::POST, "/map", body).await?;
    let bytes = Limited::new(incoming, self.endpoint.max_message_size)
      .collect()
      .await
      .map_err(|e| Error::Udf(format!("failed to read map response: {}", e)))?
      .to_bytes();
    let response: MapResponse = serde_json::from_slice(&bytes)?;
    response
      .results
      .into_iter()
      .enumerate()
      .map(|(i, result)| result.into_message(message, i))
      .collect()
  }

  async fn close_conn(&self) -> Result<()> {
    self.endpoint.close();
    Ok(())
  }
}

/// Streaming handler client.
pub struct HttpMapStreamClient {
  endpoint: Endpoint,
}

impl HttpMapStreamClient {
  /// Creates a client for the handler at `addr`.
  pub fn new(addr: &str, max_message_size: usize) -> Self {
    Self {
      endpoint: Endpoint::new(addr, max_message_size),
    }
  }

  async fn emit(
    line: &[u8],
    parent: &ReadMessage,
    index: usize,
    output: &mpsc::Sender<Message>,
  ) -> Result<()> {
    let result: MapResult = serde_json::from_slice(line)?;
    let message = result.into_message(parent, index)?;
    output
      .send(message)
      .await
      .map_err(|_| Error::Udf("map stream output receiver dropped".into()))
  }
}

#[async_trait]
impl HealthChecker for HttpMapStreamClient {
  async fn is_healthy(&self) -> Result<()> {
    self.endpoint.ready().await
  }
}

#[async_trait]
impl MapStreamApplier for HttpMapStreamClient {
  async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<()> {
    wait_until_healthy(self, cancel, READINESS_POLL_INTERVAL).await
  }

  async fn apply_map_stream(
    &self,
    message: &ReadMessage,
    output: mpsc::Sender<Message>,
  ) -> Result<()> {
    let body = self.endpoint.encode(message)?;
    let mut incoming = self.endpoint.send(Method::POST, "/mapstream", body).await?;

    let mut buf: Vec<u8> = Vec::new();
    let mut index = 0;
    while let Some(frame) = incoming.frame().await {
      let frame = frame.map_err(|e| Error::Udf(format!("map stream read failed: {}", e)))?;
      let Ok(data) = frame.into_data() else {
        continue;
      };
      buf.extend_from_slice(&data);
      for line in take_lines(&mut buf) {
        Self::emit(&line, message, index, &output).await?;
        index += 1;
      }
      if buf.len() > self.endpoint.max_message_size {
        return Err(Error::Udf(format!(
          "map stream result exceeds max message size {}",
          self.endpoint.max_message_size
        )));
      }
    }
    if !buf.iter().all(u8::is_ascii_whitespace) {
      Self::emit(&buf, message, index, &output).await?;
      index += 1;
    }
    debug!(offset = %message.read_offset, results = index, "Map stream finished");
    Ok(())
  }

  async fn close_conn(&self) -> Result<()> {
    self.endpoint.close();
    Ok(())
  }
}

/// Builds HTTP handler clients for one address.
#[derive(Clone, Debug)]
pub struct HttpUdfClientFactory {
  addr: String,
  max_message_size: usize,
}

impl HttpUdfClientFactory {
  /// Creates a factory for the handler at `addr`.
  pub fn new(addr: impl Into<String>, max_message_size: usize) -> Self {
    Self {
      addr: addr.into(),
      max_message_size,
    }
  }

  /// Creates a factory from runtime settings.
  pub fn from_settings(settings: &RuntimeSettings) -> Self {
    Self::new(settings.udf_server_addr.clone(), settings.udf_max_message_size)
  }
}

impl UdfClientFactory for HttpUdfClientFactory {
  fn map_client(&self) -> Result<Arc<dyn MapApplier>> {
    Ok(Arc::new(HttpMapClient::new(&self.addr, self.max_message_size)))
  }

  fn map_stream_client(&self) -> Result<Arc<dyn MapStreamApplier>> {
    Ok(Arc::new(HttpMapStreamClient::new(
      &self.addr,
      self.max_message_size,
    )))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::Offset;
  use crate::watermark::Watermark;
  use chrono::{TimeZone, Utc};

  fn read_message() -> ReadMessage {
    let mut message = Message::new("hello")
      .with_keys(vec!["k".into()])
      .with_event_time(Utc.timestamp_millis_opt(1_000).unwrap());
    message.headers.insert("h".into(), "v".into());
    ReadMessage {
      message,
      read_offset: Offset::new(42, 1),
      watermark: Watermark(900),
    }
  }

  #[test]
  fn test_request_encoding() {
    let request = MapRequest::from_read_message(&read_message());
    assert_eq!(request.value, STANDARD.encode("hello"));
    assert_eq!(request.event_time, 1_000);
    assert_eq!(request.watermark, 900);
    assert_eq!(request.id, "42-1");
    let json = serde_json::to_value(&request).unwrap();
    assert!(json.get("eventTime").is_some());
  }

  #[test]
  fn test_result_inherits_parent_metadata() {
    let parent = read_message();
    let result = MapResult {
      keys: vec!["out".into()],
      value: STANDARD.encode("world"),
      tags: vec!["even".into()],
    };
    let message = result.into_message(&parent, 3).unwrap();
    assert_eq!(message.value, "world");
    assert_eq!(message.tags, vec!["even".to_string()]);
    assert_eq!(message.id, "42-1-3");
    assert_eq!(message.event_time, parent.message.event_time);
    assert_eq!(message.headers.get("h").map(String::as_str), Some("v"));
  }

  #[test]
  fn test_invalid_base64_is_udf_error() {
    let result = MapResult {
      keys: vec![],
      value: "%%%".into(),
      tags: vec![],
    };
    assert!(matches!(
      result.into_message(&read_message(), 0),
      Err(Error::Udf(_))
    ));
  }

  #[test]
  fn test_take_lines_keeps_partial_tail() {
    let mut buf = b"{\"a\":1}\n\n{\"b\":2}\r\n{\"c\"".to_vec();
    let lines = take_lines(&mut buf);
    assert_eq!(lines, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
    assert_eq!(buf, b"{\"c\"".to_vec());
  }

  #[test]
  fn test_missing_results_decodes_empty() {
    let response: MapResponse = serde_json::from_str("{}").unwrap();
    assert!(response.results.is_empty());
  }

  #[tokio::test]
  async fn test_closed_client_rejects_calls() {
    let client = HttpMapClient::new("127.0.0.1:1", 1024);
    client.close_conn().await.unwrap();
    assert!(matches!(
      client.apply_map(&read_message()).await,
      Err(Error::Udf(_))
    ));
  }

  #[tokio::test]
  async fn test_oversized_request_rejected() {
    let endpoint = Endpoint::new("127.0.0.1:1", 8);
    assert!(matches!(
      endpoint.encode(&read_message()),
      Err(Error::Udf(_))
    ));
  }
}
