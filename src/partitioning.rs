//! # Destination Partitioning
//!
//! Two ways of choosing which partition of a destination vertex receives a
//! record:
//!
//! - [`PartitionCounter`]: round-robin per destination, for stages that do not
//!   care which partition sees which record.
//! - [`Shuffle`]: hash of the record's keys, for keyed-aggregation stages where
//!   every record with the same keys must land on the same partition.
//!
//! Neither type is shared between partition workers. Each worker owns its own
//! counter and shuffle cache, so no locking is involved.
//!
//! ## Usage
//!
//! ```rust
//! use streamweave_vertex::partitioning::{PartitionCounter, Shuffle};
//!
//! let mut counter = PartitionCounter::new();
//! assert_eq!(counter.next("sink", 3), 1);
//! assert_eq!(counter.next("sink", 3), 2);
//! assert_eq!(counter.next("sink", 3), 0);
//!
//! let shuffle = Shuffle::new("reduce", 4);
//! let keys = vec!["user-1".to_string()];
//! assert_eq!(shuffle.shuffle(&keys), shuffle.shuffle(&keys));
//! ```

use std::collections::HashMap;

/// Round-robin partition index generator, one running counter per
/// destination vertex.
///
/// The counter advances before it is read, so the first index handed out for
/// a fresh destination is `1 % partition_count`, not 0. Downstream consumers
/// may rely on that exact sequence.
#[derive(Debug, Default)]
pub struct PartitionCounter {
  next_partition: HashMap<String, u16>,
}

impl PartitionCounter {
  /// Creates a counter with no destinations seen yet.
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the next partition index for `to_vertex`.
  ///
  /// # Arguments
  ///
  /// * `to_vertex` - Destination vertex name
  /// * `partition_count` - Number of partitions the destination owns (>= 1)
  pub fn next(&mut self, to_vertex: &str, partition_count: u16) -> u16 {
    let count = partition_count.max(1) as u32;
    let current = self.next_partition.get(to_vertex).copied().unwrap_or(0) as u32;
    let next = ((current + 1) % count) as u16;
    self.next_partition.insert(to_vertex.to_string(), next);
    next
  }
}

/// Keyed partitioner for one destination vertex.
///
/// Uses 64-bit FNV-1a so the mapping is identical in every process and on
/// every run; `std`'s `DefaultHasher` gives no such guarantee.
#[derive(Clone, Debug)]
pub struct Shuffle {
  to_vertex: String,
  partition_count: u16,
}

impl Shuffle {
  /// Creates a shuffle function for `to_vertex` with `partition_count`
  /// partitions.
  pub fn new(to_vertex: impl Into<String>, partition_count: u16) -> Self {
    Self {
      to_vertex: to_vertex.into(),
      partition_count: partition_count.max(1),
    }
  }

  /// Destination vertex this function partitions for.
  pub fn to_vertex(&self) -> &str {
    &self.to_vertex
  }

  /// Number of destination partitions.
  pub fn partition_count(&self) -> u16 {
    self.partition_count
  }

  /// Returns the destination partition for a record with `keys`.
  pub fn shuffle(&self, keys: &[String]) -> u16 {
    (hash_keys(keys) % self.partition_count as u64) as u16
  }
}

/// FNV-1a over the bytes of every key, in order.
fn hash_keys(keys: &[String]) -> u64 {
  const FNV_OFFSET: u64 = 0xcbf29ce484222325;
  const FNV_PRIME: u64 = 0x100000001b3;

  let mut hash = FNV_OFFSET;
  for key in keys {
    for byte in key.as_bytes() {
      hash ^= *byte as u64;
      hash = hash.wrapping_mul(FNV_PRIME);
    }
  }
  hash
}
