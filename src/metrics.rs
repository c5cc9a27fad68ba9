//! Prometheus-compatible metrics for the vertex runtime.
//!
//! Forwarders record throughput and error counters through the `record_*`
//! functions. [`MetricsServer`] installs the Prometheus recorder and runs two
//! pollers in the background:
//!
//! - **Lag**: `vertex_pending_messages` per input partition, from
//!   [`BufferReader::pending`].
//! - **Health**: `vertex_udf_healthy` (1 or 0), from the handler's
//!   [`HealthChecker`].
//!
//! If no recorder is installed, recording is a no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use streamweave_vertex::metrics::MetricsServer;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> streamweave_vertex::error::Result<()> {
//! let cancel = CancellationToken::new();
//! let server = MetricsServer::new("my-map").with_addr(Some("0.0.0.0:2469".parse().unwrap()));
//! let shutdown = server.start(&cancel)?;
//! // ...
//! shutdown.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::isb::BufferReader;
use crate::udf::HealthChecker;
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between lag polls.
pub const DEFAULT_LAG_INTERVAL: Duration = Duration::from_secs(5);
/// Interval between handler health probes.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Installs the Prometheus recorder and serves metrics on the given address.
///
/// Spawns an HTTP server on the current runtime that serves metrics at
/// `GET /metrics`. Can succeed only once per process.
pub fn install_prometheus_recorder_on(addr: SocketAddr) -> Result<()> {
  use metrics_exporter_prometheus::PrometheusBuilder;
  PrometheusBuilder::new()
    .with_http_listener(addr)
    .install()
    .map_err(|e| Error::Metrics(format!("failed to install Prometheus recorder on {}: {}", addr, e)))
}

/// Records records read from an input partition.
pub fn record_read(vertex: &str, partition: &str, count: u64) {
  counter!(
    "forwarder_read_total",
    "vertex" => vertex.to_string(),
    "partition" => partition.to_string()
  )
  .increment(count);
}

/// Records records written to a destination buffer partition.
pub fn record_write(vertex: &str, to_buffer: &str, count: u64) {
  counter!(
    "forwarder_write_total",
    "vertex" => vertex.to_string(),
    "buffer" => to_buffer.to_string()
  )
  .increment(count);
}

/// Records acknowledged input records.
pub fn record_ack(vertex: &str, partition: &str, count: u64) {
  counter!(
    "forwarder_ack_total",
    "vertex" => vertex.to_string(),
    "partition" => partition.to_string()
  )
  .increment(count);
}

/// Records handler outputs tagged to be dropped.
pub fn record_drop(vertex: &str, partition: &str, count: u64) {
  counter!(
    "forwarder_drop_total",
    "vertex" => vertex.to_string(),
    "partition" => partition.to_string()
  )
  .increment(count);
}

/// Records handler outputs that matched no outgoing edge.
pub fn record_unrouted(vertex: &str, partition: &str, count: u64) {
  counter!(
    "forwarder_unrouted_total",
    "vertex" => vertex.to_string(),
    "partition" => partition.to_string()
  )
  .increment(count);
}

/// Records a failed handler call.
pub fn record_udf_error(vertex: &str, partition: &str) {
  counter!(
    "forwarder_udf_error_total",
    "vertex" => vertex.to_string(),
    "partition" => partition.to_string()
  )
  .increment(1);
}

/// Records a failed write to a destination buffer partition.
pub fn record_write_error(vertex: &str, to_buffer: &str) {
  counter!(
    "forwarder_write_error_total",
    "vertex" => vertex.to_string(),
    "buffer" => to_buffer.to_string()
  )
  .increment(1);
}

/// Sets the number of pending records of an input partition.
pub fn record_pending(vertex: &str, partition: &str, pending: i64) {
  gauge!(
    "vertex_pending_messages",
    "vertex" => vertex.to_string(),
    "partition" => partition.to_string()
  )
  .set(pending as f64);
}

/// Sets the handler health gauge.
pub fn record_udf_health(vertex: &str, healthy: bool) {
  gauge!("vertex_udf_healthy", "vertex" => vertex.to_string()).set(if healthy { 1.0 } else { 0.0 });
}

/// Metrics endpoint plus lag and health pollers for one vertex.
pub struct MetricsServer {
  vertex: String,
  addr: Option<SocketAddr>,
  health_checkers: Vec<Arc<dyn HealthChecker>>,
  lag_readers: Vec<Arc<dyn BufferReader>>,
  lag_interval: Duration,
  health_interval: Duration,
}

impl MetricsServer {
  /// Creates a server for `vertex` with no endpoint and nothing to poll.
  pub fn new(vertex: impl Into<String>) -> Self {
    Self {
      vertex: vertex.into(),
      addr: None,
      health_checkers: Vec::new(),
      lag_readers: Vec::new(),
      lag_interval: DEFAULT_LAG_INTERVAL,
      health_interval: DEFAULT_HEALTH_INTERVAL,
    }
  }

  /// Sets the listen address. No recorder is installed when `None`.
  #[must_use]
  pub fn with_addr(mut self, addr: Option<SocketAddr>) -> Self {
    self.addr = addr;
    self
  }

  /// Adds a health checker to probe.
  #[must_use]
  pub fn with_health_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
    self.health_checkers.push(checker);
    self
  }

  /// Sets the readers whose pending count is reported.
  #[must_use]
  pub fn with_lag_readers(mut self, readers: Vec<Arc<dyn BufferReader>>) -> Self {
    self.lag_readers = readers;
    self
  }

  /// Sets the poll intervals.
  #[must_use]
  pub fn with_intervals(mut self, lag: Duration, health: Duration) -> Self {
    self.lag_interval = lag;
    self.health_interval = health;
    self
  }

  /// Installs the recorder (when an address is set) and spawns the pollers.
  /// Pollers stop when `cancel` fires or the returned handle is shut down.
  pub fn start(&self, cancel: &CancellationToken) -> Result<MetricsShutdown> {
    if let Some(addr) = self.addr {
      install_prometheus_recorder_on(addr)?;
      info!(vertex = %self.vertex, %addr, "Metrics server listening");
    }

    let token = cancel.child_token();
    let mut tasks = JoinSet::new();

    if !self.lag_readers.is_empty() {
      let vertex = self.vertex.clone();
      let readers = self.lag_readers.clone();
      let interval = self.lag_interval;
      let token = token.clone();
      tasks.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
          tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
              for reader in &readers {
                match reader.pending().await {
                  Ok(Some(pending)) => record_pending(&vertex, reader.name(), pending),
                  Ok(None) => {}
                  Err(e) => debug!(partition = reader.name(), error = %e, "Failed to read pending count"),
                }
              }
            }
          }
        }
      });
    }

    if !self.health_checkers.is_empty() {
      let vertex = self.vertex.clone();
      let checkers = self.health_checkers.clone();
      let interval = self.health_interval;
      let token = token.clone();
      tasks.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
          tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
              let mut healthy = true;
              for checker in &checkers {
                if let Err(e) = checker.is_healthy().await {
                  warn!(vertex = %vertex, error = %e, "Handler health check failed");
                  healthy = false;
                }
              }
              record_udf_health(&vertex, healthy);
            }
          }
        }
      });
    }

    Ok(MetricsShutdown { token, tasks })
  }
}

/// Stops the pollers of a started [`MetricsServer`].
pub struct MetricsShutdown {
  token: CancellationToken,
  tasks: JoinSet<()>,
}

impl MetricsShutdown {
  /// Number of running pollers.
  pub fn poller_count(&self) -> usize {
    self.tasks.len()
  }

  /// Stops the pollers and waits for them to exit.
  pub async fn shutdown(mut self) {
    self.token.cancel();
    while self.tasks.join_next().await.is_some() {}
  }
}
