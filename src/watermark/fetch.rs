//! Watermark fetching.

use super::Watermark;
use super::processor::ProcessorManager;
use crate::message::Offset;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Computes the watermark of records read from this vertex's input.
#[async_trait]
pub trait Fetcher: Send + Sync {
  /// Watermark for a record read at `offset`.
  async fn compute_watermark(&self, offset: &Offset) -> Watermark;
}

/// Fetcher used when watermarks are disabled; always [`Watermark::INIT`].
#[derive(Clone, Debug, Default)]
pub struct NoOpFetcher;

#[async_trait]
impl Fetcher for NoOpFetcher {
  async fn compute_watermark(&self, _offset: &Offset) -> Watermark {
    Watermark::INIT
  }
}

/// Fetcher over every incoming edge of the vertex.
///
/// A partition's watermark is the minimum across upstream vertices, each of
/// which is the minimum across its active processors. Each input partition
/// keeps its own last processed watermark, which never moves backwards; the
/// returned watermark is the minimum of these across all input partitions.
pub struct EdgeFetcherSet {
  managers: HashMap<String, Arc<ProcessorManager>>,
  last_processed: Mutex<HashMap<u16, Watermark>>,
}

impl EdgeFetcherSet {
  /// Creates a fetcher over the given processor managers, keyed by upstream
  /// vertex name, for a vertex reading `partition_count` input partitions.
  pub fn new(managers: HashMap<String, Arc<ProcessorManager>>, partition_count: u16) -> Self {
    let last_processed = (0..partition_count.max(1))
      .map(|idx| (idx, Watermark::INIT))
      .collect();
    Self {
      managers,
      last_processed: Mutex::new(last_processed),
    }
  }
}

#[async_trait]
impl Fetcher for EdgeFetcherSet {
  async fn compute_watermark(&self, offset: &Offset) -> Watermark {
    let mut computed: Option<Watermark> = None;
    for manager in self.managers.values() {
      let edge_wm = manager
        .watermark_at(offset.partition_idx, offset.sequence)
        .await
        .unwrap_or(Watermark::INIT);
      computed = Some(computed.map_or(edge_wm, |wm| wm.min(edge_wm)));
    }
    let computed = computed.unwrap_or(Watermark::INIT);

    let mut last = self.last_processed.lock().await;
    let entry = last.entry(offset.partition_idx).or_insert(Watermark::INIT);
    if computed > *entry {
      *entry = computed;
    }
    last.values().copied().min().unwrap_or(Watermark::INIT)
  }
}
