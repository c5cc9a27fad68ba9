//! # Output Router
//!
//! Decides, for every record produced by the transformation handler, which
//! destination buffer partitions must receive a copy.
//!
//! A [`Router`] is a small strategy object invoked once per outgoing record.
//! The concrete [`OutputRouter`] evaluates every outgoing edge of the vertex:
//!
//! 1. A record tagged with [`MESSAGE_TAG_DROP`](crate::topology::MESSAGE_TAG_DROP)
//!    goes nowhere.
//! 2. For every edge whose tag condition matches, one [`VertexBuffer`] is
//!    produced. Keyed-aggregation destinations with more than one partition
//!    get the partition from the edge's [`Shuffle`]; all others get it from
//!    the router's [`PartitionCounter`].
//!
//! A record that matches no edge yields an empty assignment and is silently
//! not forwarded. Routing never fails; edges are validated when the topology
//! is loaded.
//!
//! Every partition worker builds its own `OutputRouter`, so the counter and
//! shuffle functions are owned exclusively and need no locking.

use crate::partitioning::{PartitionCounter, Shuffle};
use crate::topology::{Edge, is_dropped};
use std::sync::Arc;

/// A destination partition for one record.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct VertexBuffer {
  /// Destination vertex name.
  pub to_vertex_name: String,
  /// Partition of the destination vertex.
  pub to_vertex_partition_idx: u16,
}

/// Chooses the destination partitions for an outgoing record.
pub trait Router: Send + Sync {
  /// Returns every destination that must receive a record with the given
  /// routing `keys` and `tags`. May be empty.
  fn route(&mut self, keys: &[String], tags: &[String]) -> Vec<VertexBuffer>;
}

/// Edge-driven router owning its round-robin state and one shuffle function
/// per keyed edge.
#[derive(Debug)]
pub struct OutputRouter {
  edges: Arc<[Edge]>,
  counter: PartitionCounter,
  shuffles: Vec<Option<Shuffle>>,
}

impl OutputRouter {
  /// Creates a router for the given outgoing edges.
  ///
  /// A shuffle function is built once for every edge that needs one and kept
  /// at the edge's position.
  pub fn new(edges: Arc<[Edge]>) -> Self {
    let shuffles = edges
      .iter()
      .map(|edge| {
        edge
          .needs_shuffle()
          .then(|| Shuffle::new(edge.to.clone(), edge.partition_count()))
      })
      .collect();
    Self {
      edges,
      counter: PartitionCounter::new(),
      shuffles,
    }
  }

  /// Number of cached shuffle functions.
  pub fn shuffle_count(&self) -> usize {
    self.shuffles.iter().filter(|s| s.is_some()).count()
  }
}

impl Router for OutputRouter {
  fn route(&mut self, keys: &[String], tags: &[String]) -> Vec<VertexBuffer> {
    if is_dropped(tags) {
      return Vec::new();
    }

    let mut result = Vec::new();
    for (edge, shuffle) in self.edges.iter().zip(&self.shuffles) {
      if !edge.matches(tags) {
        continue;
      }
      let to_vertex_partition_idx = match shuffle {
        Some(shuffle) => shuffle.shuffle(keys),
        None => self.counter.next(&edge.to, edge.partition_count()),
      };
      result.push(VertexBuffer {
        to_vertex_name: edge.to.clone(),
        to_vertex_partition_idx,
      });
    }
    result
  }
}
