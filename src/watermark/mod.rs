//! # Watermarks
//!
//! A watermark is a causal progress marker: a vertex that publishes watermark
//! `w` promises that it will not emit records with event time earlier than
//! `w` any more. Downstream vertices fetch the watermarks published by every
//! upstream processor and take the minimum.
//!
//! ## Components
//!
//! - [`store::WatermarkStore`]: KV store shared by the two ends of an edge.
//!   Holds processor heartbeats and each processor's latest [`Wmb`].
//! - [`publish::Publisher`]: writes this processor's watermark for one
//!   destination vertex, keeps a heartbeat alive.
//! - [`processor::ProcessorManager`]: watches one upstream store and keeps an
//!   [`timeline::OffsetTimeline`] per upstream processor and partition.
//! - [`fetch::Fetcher`]: turns a read offset into a watermark using the
//!   processor managers.
//! - [`generic`]: builders wiring the above together, plus no-op variants for
//!   when watermarks are disabled.
//!
//! Fetchers and publishers are created once per vertex run and shared by all
//! partition forwarders. Stores may be shared by several publishers, so a
//! publisher's `close` only removes its own keys; the lifecycle manager closes
//! stores last.

pub mod fetch;
pub mod generic;
pub mod processor;
pub mod publish;
pub mod store;
pub mod timeline;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event-time watermark in epoch milliseconds.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark(pub i64);

impl Watermark {
  /// Watermark before any progress has been made.
  pub const INIT: Watermark = Watermark(-1);

  /// Returns the raw epoch milliseconds.
  pub fn as_millis(self) -> i64 {
    self.0
  }

  /// Returns true if this is [`Watermark::INIT`] or earlier.
  pub fn is_init(self) -> bool {
    self.0 <= Self::INIT.0
  }

  /// Converts to a UTC timestamp, if representable.
  pub fn to_datetime(self) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(self.0).single()
  }
}

impl Default for Watermark {
  fn default() -> Self {
    Self::INIT
  }
}

impl From<DateTime<Utc>> for Watermark {
  fn from(time: DateTime<Utc>) -> Self {
    Watermark(time.timestamp_millis())
  }
}

impl fmt::Display for Watermark {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.to_datetime() {
      Some(t) if !self.is_init() => write!(f, "{}", t.to_rfc3339()),
      _ => write!(f, "{}", self.0),
    }
  }
}

/// Watermark-bearing record published by a processor for one partition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Wmb {
  /// The processor had nothing to forward when this was published.
  pub idle: bool,
  /// Last offset written by the processor to the partition.
  pub offset: i64,
  /// Watermark at that offset, epoch millis.
  pub watermark: i64,
  /// Destination partition.
  pub partition: u16,
}

impl Wmb {
  /// Encodes to the store representation.
  pub fn encode(&self) -> crate::error::Result<bytes::Bytes> {
    Ok(bytes::Bytes::from(serde_json::to_vec(self)?))
  }

  /// Decodes from the store representation.
  pub fn decode(raw: &[u8]) -> crate::error::Result<Self> {
    Ok(serde_json::from_slice(raw)?)
  }
}
