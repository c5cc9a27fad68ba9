//! # Error Handling
//!
//! A single error type for the vertex runtime. Errors split into two groups:
//!
//! - **Startup errors** (`Config`, `Provision`, `Udf` during readiness,
//!   `Metrics`): returned from [`MapUdfProcessor::start`] before any partition
//!   worker is spawned.
//! - **Runtime errors** (`Buffer`, `BufferFull`, `Watermark`, `StoreClosed`,
//!   `Forwarder`): raised inside forwarders and teardown. These never leave
//!   the lifecycle manager; they are logged and the run continues to quiesce.
//!
//! Routing never fails, so there is no routing variant.
//!
//! [`MapUdfProcessor::start`]: crate::processor::MapUdfProcessor::start

use thiserror::Error;

/// Error type for all vertex runtime operations.
#[derive(Error, Debug)]
pub enum Error {
  /// Malformed vertex specification or runtime settings.
  #[error("config error: {0}")]
  Config(String),

  /// Backend could not build readers, writers or watermark components.
  #[error("provisioning error: {0}")]
  Provision(String),

  /// Buffer read, write or ack failed.
  #[error("buffer error: {0}")]
  Buffer(String),

  /// Buffer has no room left; the write can be retried.
  #[error("buffer {0} is full")]
  BufferFull(String),

  /// Watermark fetch or publish failed.
  #[error("watermark error: {0}")]
  Watermark(String),

  /// Operation on a watermark store that was already closed.
  #[error("watermark store {0} is closed")]
  StoreClosed(String),

  /// Transformation handler call or readiness probe failed.
  #[error("udf error: {0}")]
  Udf(String),

  /// Metrics recorder or endpoint could not be installed.
  #[error("metrics error: {0}")]
  Metrics(String),

  /// Forwarder construction or run-loop failure.
  #[error("forwarder error: {0}")]
  Forwarder(String),

  /// The operation observed a stop request and gave up.
  #[error("cancelled")]
  Cancelled,

  /// JSON encoding or decoding failed.
  #[error(transparent)]
  Json(#[from] serde_json::Error),
}

impl Error {
  /// Returns true when the failed operation may succeed if retried later.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Error::BufferFull(_) | Error::Udf(_))
  }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
