//! # Inter-Step Buffers
//!
//! Buffers connect vertices. Each vertex owns one buffer partition per input
//! partition and writes into the partitions of its destinations.
//!
//! The runtime only sees buffers through [`BufferReader`] and
//! [`BufferWriter`]; broker-specific implementations live behind these traits.
//! [`simple::SimpleBuffer`] is the in-process implementation.
//!
//! Readers are owned by exactly one forwarder. Writers are shared by every
//! forwarder of the vertex and must be safe for concurrent use.

pub mod simple;

use crate::error::Result;
use crate::message::{Message, Offset, ReadMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Read side of a buffer partition.
#[async_trait]
pub trait BufferReader: Send + Sync {
  /// Buffer partition name.
  fn name(&self) -> &str;

  /// Partition index.
  fn partition_idx(&self) -> u16;

  /// Reads up to `count` messages. May return fewer, or none after a read
  /// timeout.
  async fn read(&self, count: usize) -> Result<Vec<ReadMessage>>;

  /// Acknowledges processed messages.
  async fn ack(&self, offsets: &[Offset]) -> Result<()>;

  /// Messages written but not yet acknowledged; `None` if unknown.
  async fn pending(&self) -> Result<Option<i64>>;

  /// Closes the reader.
  async fn close(&self) -> Result<()>;
}

/// Write side of a buffer partition.
#[async_trait]
pub trait BufferWriter: Send + Sync {
  /// Buffer partition name.
  fn name(&self) -> &str;

  /// Partition index.
  fn partition_idx(&self) -> u16;

  /// Writes the leading messages that fit, in order, and returns their
  /// offsets. Fewer offsets than messages means the partition filled up; the
  /// caller resends the remainder.
  ///
  /// # Errors
  ///
  /// `Error::BufferFull` when the partition has no room at all; the caller may
  /// retry.
  async fn write(&self, messages: Vec<Message>) -> Result<Vec<Offset>>;

  /// Closes the writer.
  async fn close(&self) -> Result<()>;
}

/// Writers keyed by destination vertex name; one writer per destination
/// partition, indexed by partition.
pub type WriterMap = HashMap<String, Vec<Arc<dyn BufferWriter>>>;
