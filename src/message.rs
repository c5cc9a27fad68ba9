//! Records flowing through the vertex.
//!
//! A [`Message`] is what the transformation handler consumes and produces.
//! A [`ReadMessage`] wraps a message read from an input partition together
//! with the offset to ack and the watermark computed for its batch.

use crate::watermark::Watermark;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

/// Position of a record inside one buffer partition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Offset {
  /// Monotonic sequence number within the partition.
  pub sequence: i64,
  /// Partition the sequence belongs to.
  pub partition_idx: u16,
}

impl Offset {
  /// Creates a new offset.
  pub fn new(sequence: i64, partition_idx: u16) -> Self {
    Self {
      sequence,
      partition_idx,
    }
  }
}

impl fmt::Display for Offset {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.sequence, self.partition_idx)
  }
}

/// A record with its routing information.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
  /// Routing keys; used for shuffling into keyed stages.
  pub keys: Vec<String>,
  /// Tags; matched against edge conditions.
  pub tags: Vec<String>,
  /// Opaque payload.
  pub value: Bytes,
  /// Time the event happened.
  pub event_time: DateTime<Utc>,
  /// Unique id, derived from the read offset for handler outputs.
  pub id: String,
  /// User headers.
  pub headers: HashMap<String, String>,
}

impl Message {
  /// Creates an untagged message with the current time as event time.
  pub fn new(value: impl Into<Bytes>) -> Self {
    Self {
      keys: Vec::new(),
      tags: Vec::new(),
      value: value.into(),
      event_time: Utc::now(),
      id: String::new(),
      headers: HashMap::new(),
    }
  }

  /// Sets the routing keys.
  #[must_use]
  pub fn with_keys(mut self, keys: Vec<String>) -> Self {
    self.keys = keys;
    self
  }

  /// Sets the tags.
  #[must_use]
  pub fn with_tags(mut self, tags: Vec<String>) -> Self {
    self.tags = tags;
    self
  }

  /// Sets the event time.
  #[must_use]
  pub fn with_event_time(mut self, event_time: DateTime<Utc>) -> Self {
    self.event_time = event_time;
    self
  }

  /// Sets the id.
  #[must_use]
  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = id.into();
    self
  }
}

/// A message read from an input partition.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadMessage {
  /// The record.
  pub message: Message,
  /// Offset to ack once the record has been forwarded.
  pub read_offset: Offset,
  /// Watermark of the batch the record was read in.
  pub watermark: Watermark,
}
