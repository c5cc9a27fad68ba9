//! Tracking of upstream processors.
//!
//! A processor is one replica of an upstream vertex that publishes watermarks
//! into the store of the edge feeding this vertex. [`ProcessorManager`] polls
//! that store: heartbeats decide which processors are alive, offset-timeline
//! entries feed one [`OffsetTimeline`] per processor and partition.

use super::store::{Bucket, WatermarkStore};
use super::timeline::OffsetTimeline;
use super::{Watermark, Wmb};
use crate::error::{Error, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Liveness of an upstream processor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessorStatus {
  /// Heartbeat seen within the TTL.
  Active,
  /// Heartbeat older than the TTL.
  Inactive,
}

/// Settings of a [`ProcessorManager`].
#[derive(Clone, Debug)]
pub struct ProcessorManagerConfig {
  /// How often the store is polled.
  pub refresh_interval: Duration,
  /// Processors whose heartbeat is older than this are inactive.
  pub heartbeat_ttl: Duration,
  /// Entries kept per offset timeline.
  pub timeline_capacity: usize,
}

impl Default for ProcessorManagerConfig {
  fn default() -> Self {
    Self {
      refresh_interval: Duration::from_secs(1),
      heartbeat_ttl: Duration::from_secs(10),
      timeline_capacity: super::timeline::DEFAULT_TIMELINE_CAPACITY,
    }
  }
}

impl ProcessorManagerConfig {
  /// Sets the refresh interval.
  #[must_use]
  pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
    self.refresh_interval = interval;
    self
  }

  /// Sets the heartbeat TTL.
  #[must_use]
  pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
    self.heartbeat_ttl = ttl;
    self
  }
}

#[derive(Debug)]
struct ProcessorEntry {
  last_heartbeat: i64,
  status: ProcessorStatus,
  timelines: HashMap<u16, OffsetTimeline>,
}

/// Watches the watermark store of one incoming edge.
pub struct ProcessorManager {
  from_vertex: String,
  store: Arc<dyn WatermarkStore>,
  config: ProcessorManagerConfig,
  processors: RwLock<HashMap<String, ProcessorEntry>>,
  shutdown: CancellationToken,
  watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessorManager {
  /// Creates a manager and starts watching `store`.
  ///
  /// Must be called from within a tokio runtime.
  pub fn start(
    from_vertex: impl Into<String>,
    store: Arc<dyn WatermarkStore>,
    config: ProcessorManagerConfig,
  ) -> Arc<Self> {
    let manager = Arc::new(Self {
      from_vertex: from_vertex.into(),
      store,
      config,
      processors: RwLock::new(HashMap::new()),
      shutdown: CancellationToken::new(),
      watcher: Mutex::new(None),
    });

    let watched = Arc::clone(&manager);
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(watched.config.refresh_interval);
      loop {
        tokio::select! {
          _ = watched.shutdown.cancelled() => break,
          _ = ticker.tick() => {
            if let Err(e) = watched.refresh().await {
              warn!(from_vertex = %watched.from_vertex, error = %e, "Failed to refresh processors");
            }
          }
        }
      }
      debug!(from_vertex = %watched.from_vertex, "Processor watcher exited");
    });
    if let Ok(mut watcher) = manager.watcher.try_lock() {
      *watcher = Some(handle);
    }
    manager
  }

  /// Upstream vertex this manager tracks.
  pub fn from_vertex(&self) -> &str {
    &self.from_vertex
  }

  /// Reads heartbeats and timelines from the store once.
  pub async fn refresh(&self) -> Result<()> {
    let now = Utc::now().timestamp();
    let ttl = self.config.heartbeat_ttl.as_secs() as i64;

    let mut heartbeats = HashMap::new();
    for entity in self.store.keys(Bucket::Heartbeat).await? {
      if let Some(raw) = self.store.get(Bucket::Heartbeat, &entity).await? {
        let seen: i64 = serde_json::from_slice(&raw)?;
        heartbeats.insert(entity, seen);
      }
    }

    let mut wmbs = Vec::new();
    for key in self.store.keys(Bucket::OffsetTimeline).await? {
      let Some((entity, _)) = key.rsplit_once(':') else {
        continue;
      };
      if let Some(raw) = self.store.get(Bucket::OffsetTimeline, &key).await? {
        wmbs.push((entity.to_string(), Wmb::decode(&raw)?));
      }
    }

    let mut processors = self.processors.write().await;
    processors.retain(|entity, _| heartbeats.contains_key(entity));
    for (entity, seen) in heartbeats {
      let status = if now - seen > ttl {
        ProcessorStatus::Inactive
      } else {
        ProcessorStatus::Active
      };
      let entry = processors
        .entry(entity.clone())
        .or_insert_with(|| {
          info!(from_vertex = %self.from_vertex, processor = %entity, "Discovered processor");
          ProcessorEntry {
            last_heartbeat: seen,
            status,
            timelines: HashMap::new(),
          }
        });
      entry.last_heartbeat = seen;
      entry.status = status;
    }
    for (entity, wmb) in wmbs {
      if let Some(entry) = processors.get_mut(&entity) {
        entry
          .timelines
          .entry(wmb.partition)
          .or_insert_with(|| OffsetTimeline::new(self.config.timeline_capacity))
          .put(wmb);
      }
    }
    Ok(())
  }

  /// Status of one processor, if known.
  pub async fn status(&self, entity: &str) -> Option<ProcessorStatus> {
    self.processors.read().await.get(entity).map(|p| p.status)
  }

  /// Number of active processors.
  pub async fn active_count(&self) -> usize {
    self
      .processors
      .read()
      .await
      .values()
      .filter(|p| p.status == ProcessorStatus::Active)
      .count()
  }

  /// Minimum watermark across active processors for a record read at
  /// `offset` on `partition`. `None` when no processor is active.
  pub async fn watermark_at(&self, partition: u16, offset: i64) -> Option<Watermark> {
    self
      .processors
      .read()
      .await
      .values()
      .filter(|p| p.status == ProcessorStatus::Active)
      .map(|p| {
        p.timelines
          .get(&partition)
          .map(|t| t.get_event_time(offset))
          .unwrap_or(Watermark::INIT)
      })
      .min()
  }

  /// Stops watching and closes the watched store.
  pub async fn close(&self) -> Result<()> {
    self.shutdown.cancel();
    let handle = self.watcher.lock().await.take();
    if let Some(handle) = handle {
      handle
        .await
        .map_err(|e| Error::Watermark(format!("processor watcher panicked: {}", e)))?;
    }
    self.store.close().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::watermark::store::InMemoryStore;
  use bytes::Bytes;

  async fn heartbeat(store: &InMemoryStore, entity: &str, at: i64) {
    store
      .put(
        Bucket::Heartbeat,
        entity,
        Bytes::from(serde_json::to_vec(&at).unwrap()),
      )
      .await
      .unwrap();
  }

  async fn publish(store: &InMemoryStore, entity: &str, wmb: Wmb) {
    store
      .put(
        Bucket::OffsetTimeline,
        &format!("{}:{}", entity, wmb.partition),
        wmb.encode().unwrap(),
      )
      .await
      .unwrap();
  }

  fn idle_config() -> ProcessorManagerConfig {
    ProcessorManagerConfig::default().with_refresh_interval(Duration::from_secs(3600))
  }

  #[tokio::test]
  async fn test_min_over_active_processors() {
    let store = Arc::new(InMemoryStore::new("p-in-map"));
    let now = Utc::now().timestamp();
    heartbeat(&store, "in-0", now).await;
    heartbeat(&store, "in-1", now).await;
    publish(&store, "in-0", Wmb { idle: false, offset: 5, watermark: 1_000, partition: 0 }).await;
    publish(&store, "in-1", Wmb { idle: false, offset: 3, watermark: 700, partition: 0 }).await;

    let manager = ProcessorManager::start("in", store.clone(), idle_config());
    manager.refresh().await.unwrap();
    assert_eq!(manager.active_count().await, 2);
    assert_eq!(manager.watermark_at(0, 10).await, Some(Watermark(700)));
    assert_eq!(manager.watermark_at(0, 4).await, Some(Watermark::INIT));
    manager.close().await.unwrap();
    assert!(store.is_closed());
  }

  #[tokio::test]
  async fn test_stale_heartbeat_is_inactive() {
    let store = Arc::new(InMemoryStore::new("p-in-map"));
    heartbeat(&store, "in-0", Utc::now().timestamp() - 3_600).await;
    let manager = ProcessorManager::start("in", store.clone(), idle_config());
    manager.refresh().await.unwrap();
    assert_eq!(manager.status("in-0").await, Some(ProcessorStatus::Inactive));
    assert_eq!(manager.watermark_at(0, 10).await, None);
    manager.close().await.unwrap();
  }

  #[tokio::test]
  async fn test_deleted_heartbeat_evicts_processor() {
    let store = Arc::new(InMemoryStore::new("p-in-map"));
    heartbeat(&store, "in-0", Utc::now().timestamp()).await;
    let manager = ProcessorManager::start("in", store.clone(), idle_config());
    manager.refresh().await.unwrap();
    assert!(manager.status("in-0").await.is_some());

    store.delete(Bucket::Heartbeat, "in-0").await.unwrap();
    manager.refresh().await.unwrap();
    assert!(manager.status("in-0").await.is_none());
    manager.close().await.unwrap();
  }
}
