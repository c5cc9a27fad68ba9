//! Watermark stores.
//!
//! A store is a small KV space with two buckets: heartbeats (processor entity
//! → last-seen epoch seconds) and offset timelines (`entity:partition` →
//! encoded [`Wmb`](super::Wmb)). Every operation on a closed store fails with
//! [`Error::StoreClosed`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Bucket inside a watermark store.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum Bucket {
  /// Processor liveness.
  Heartbeat,
  /// Latest watermark per processor and partition.
  OffsetTimeline,
}

/// KV store backing watermark propagation across one edge.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
  /// Store name.
  fn name(&self) -> &str;

  /// Writes `value` under `key`.
  async fn put(&self, bucket: Bucket, key: &str, value: Bytes) -> Result<()>;

  /// Reads the value under `key`.
  async fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Bytes>>;

  /// Removes `key`; removing a missing key is not an error.
  async fn delete(&self, bucket: Bucket, key: &str) -> Result<()>;

  /// Lists the keys of a bucket.
  async fn keys(&self, bucket: Bucket) -> Result<Vec<String>>;

  /// Closes the store. Closing twice is not an error.
  async fn close(&self) -> Result<()>;
}

/// Process-local watermark store.
#[derive(Debug)]
pub struct InMemoryStore {
  name: String,
  entries: RwLock<BTreeMap<(Bucket, String), Bytes>>,
  closed: AtomicBool,
}

impl InMemoryStore {
  /// Creates an empty store.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      entries: RwLock::new(BTreeMap::new()),
      closed: AtomicBool::new(false),
    }
  }

  /// Returns true once `close` has been called.
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  fn ensure_open(&self) -> Result<()> {
    if self.is_closed() {
      return Err(Error::StoreClosed(self.name.clone()));
    }
    Ok(())
  }
}

#[async_trait]
impl WatermarkStore for InMemoryStore {
  fn name(&self) -> &str {
    &self.name
  }

  async fn put(&self, bucket: Bucket, key: &str, value: Bytes) -> Result<()> {
    self.ensure_open()?;
    self
      .entries
      .write()
      .await
      .insert((bucket, key.to_string()), value);
    Ok(())
  }

  async fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Bytes>> {
    self.ensure_open()?;
    Ok(
      self
        .entries
        .read()
        .await
        .get(&(bucket, key.to_string()))
        .cloned(),
    )
  }

  async fn delete(&self, bucket: Bucket, key: &str) -> Result<()> {
    self.ensure_open()?;
    self.entries.write().await.remove(&(bucket, key.to_string()));
    Ok(())
  }

  async fn keys(&self, bucket: Bucket) -> Result<Vec<String>> {
    self.ensure_open()?;
    Ok(
      self
        .entries
        .read()
        .await
        .keys()
        .filter(|(b, _)| *b == bucket)
        .map(|(_, k)| k.clone())
        .collect(),
    )
  }

  async fn close(&self) -> Result<()> {
    self.closed.store(true, Ordering::Release);
    Ok(())
  }
}
