//! # Transformation Handler Boundary
//!
//! The user map transformation runs out of process. The vertex talks to it
//! through one of two mutually exclusive call shapes:
//!
//! - [`MapApplier`]: one request, one response carrying zero or more records.
//! - [`MapStreamApplier`]: one request, records streamed back as they are
//!   produced.
//!
//! [`UdfHandler`] holds whichever shape the vertex was configured with.
//! [`http`] provides the concrete clients.

pub mod http;

use crate::error::{Error, Result};
use crate::message::{Message, ReadMessage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Interval between readiness probes.
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Something that can report whether it is able to serve requests.
#[async_trait]
pub trait HealthChecker: Send + Sync {
  /// Returns `Ok` when healthy.
  async fn is_healthy(&self) -> Result<()>;
}

/// Request/response map handler.
#[async_trait]
pub trait MapApplier: HealthChecker {
  /// Blocks until the handler is ready or `cancel` fires.
  async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<()>;

  /// Applies the transformation to one record.
  async fn apply_map(&self, message: &ReadMessage) -> Result<Vec<Message>>;

  /// Releases the connection to the handler.
  async fn close_conn(&self) -> Result<()>;
}

/// Streaming map handler.
#[async_trait]
pub trait MapStreamApplier: HealthChecker {
  /// Blocks until the handler is ready or `cancel` fires.
  async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<()>;

  /// Applies the transformation to one record, sending every result on
  /// `output` as soon as it arrives. Returns once the handler has finished
  /// with the record.
  async fn apply_map_stream(&self, message: &ReadMessage, output: mpsc::Sender<Message>)
  -> Result<()>;

  /// Releases the connection to the handler.
  async fn close_conn(&self) -> Result<()>;
}

/// The handler a vertex runs with.
#[derive(Clone)]
pub enum UdfHandler {
  /// Request/response call shape.
  Map(Arc<dyn MapApplier>),
  /// Streaming call shape.
  MapStream(Arc<dyn MapStreamApplier>),
}

impl UdfHandler {
  /// Returns true for the streaming call shape.
  pub fn is_streaming(&self) -> bool {
    matches!(self, UdfHandler::MapStream(_))
  }

  /// Blocks until the handler is ready or `cancel` fires.
  pub async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<()> {
    match self {
      UdfHandler::Map(h) => h.wait_until_ready(cancel).await,
      UdfHandler::MapStream(h) => h.wait_until_ready(cancel).await,
    }
  }

  /// Releases the connection to the handler.
  pub async fn close_conn(&self) -> Result<()> {
    match self {
      UdfHandler::Map(h) => h.close_conn().await,
      UdfHandler::MapStream(h) => h.close_conn().await,
    }
  }

  /// The handler as a health checker, for the metrics server.
  pub fn health_checker(&self) -> Arc<dyn HealthChecker> {
    Arc::new(self.clone())
  }
}

#[async_trait]
impl HealthChecker for UdfHandler {
  async fn is_healthy(&self) -> Result<()> {
    match self {
      UdfHandler::Map(h) => h.is_healthy().await,
      UdfHandler::MapStream(h) => h.is_healthy().await,
    }
  }
}

/// Builds handler clients.
pub trait UdfClientFactory: Send + Sync {
  /// Request/response client.
  fn map_client(&self) -> Result<Arc<dyn MapApplier>>;

  /// Streaming client.
  fn map_stream_client(&self) -> Result<Arc<dyn MapStreamApplier>>;

  /// Client for the requested call shape.
  fn handler(&self, streaming: bool) -> Result<UdfHandler> {
    if streaming {
      Ok(UdfHandler::MapStream(self.map_stream_client()?))
    } else {
      Ok(UdfHandler::Map(self.map_client()?))
    }
  }
}

/// Polls `checker` every `interval` until it reports healthy.
///
/// # Errors
///
/// `Error::Cancelled` if `cancel` fires first.
pub async fn wait_until_healthy(
  checker: &dyn HealthChecker,
  cancel: &CancellationToken,
  interval: Duration,
) -> Result<()> {
  loop {
    match checker.is_healthy().await {
      Ok(()) => return Ok(()),
      Err(e) => debug!(error = %e, "Handler not ready yet"),
    }
    tokio::select! {
      _ = cancel.cancelled() => return Err(Error::Cancelled),
      _ = tokio::time::sleep(interval) => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct Flaky {
    calls: AtomicUsize,
    healthy_after: usize,
  }

  #[async_trait]
  impl HealthChecker for Flaky {
    async fn is_healthy(&self) -> Result<()> {
      let n = self.calls.fetch_add(1, Ordering::SeqCst);
      if n >= self.healthy_after {
        Ok(())
      } else {
        Err(Error::Udf("not ready".into()))
      }
    }
  }

  #[tokio::test]
  async fn test_wait_until_healthy_polls() {
    let checker = Flaky {
      calls: AtomicUsize::new(0),
      healthy_after: 2,
    };
    let cancel = CancellationToken::new();
    wait_until_healthy(&checker, &cancel, Duration::from_millis(1))
      .await
      .unwrap();
    assert_eq!(checker.calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_wait_until_healthy_cancelled() {
    let checker = Flaky {
      calls: AtomicUsize::new(0),
      healthy_after: usize::MAX,
    };
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = wait_until_healthy(&checker, &cancel, Duration::from_secs(60))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
  }
}
