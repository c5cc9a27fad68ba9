//! Watermark publishing.

use super::store::{Bucket, WatermarkStore};
use super::{Watermark, Wmb};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Publishes this processor's watermark for one destination vertex.
#[async_trait]
pub trait Publisher: Send + Sync {
  /// Publishes `watermark` as reached at `offset` of destination partition
  /// `partition`.
  async fn publish_watermark(
    &self,
    watermark: Watermark,
    offset: i64,
    partition: u16,
  ) -> Result<()>;

  /// Last watermark published for `partition`.
  async fn head_watermark(&self, partition: u16) -> Watermark;

  /// Stops heartbeating and deletes this publisher's keys. The backing store
  /// itself stays open; it may be shared with other publishers.
  async fn close(&self) -> Result<()>;
}

/// Publisher used when watermarks are disabled.
#[derive(Clone, Debug, Default)]
pub struct NoOpPublisher;

#[async_trait]
impl Publisher for NoOpPublisher {
  async fn publish_watermark(
    &self,
    _watermark: Watermark,
    _offset: i64,
    _partition: u16,
  ) -> Result<()> {
    Ok(())
  }

  async fn head_watermark(&self, _partition: u16) -> Watermark {
    Watermark::INIT
  }

  async fn close(&self) -> Result<()> {
    Ok(())
  }
}

/// Publisher writing into a [`WatermarkStore`].
pub struct StorePublisher {
  entity: String,
  store: Arc<dyn WatermarkStore>,
  heads: Mutex<HashMap<u16, Wmb>>,
  shutdown: CancellationToken,
  heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl StorePublisher {
  /// Creates a publisher for processor `entity` and starts heartbeating every
  /// `heartbeat_interval`.
  ///
  /// Must be called from within a tokio runtime.
  pub fn start(
    entity: impl Into<String>,
    store: Arc<dyn WatermarkStore>,
    heartbeat_interval: Duration,
  ) -> Arc<Self> {
    let entity = entity.into();
    let shutdown = CancellationToken::new();

    let hb_store = Arc::clone(&store);
    let hb_entity = entity.clone();
    let hb_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(heartbeat_interval);
      loop {
        tokio::select! {
          _ = hb_shutdown.cancelled() => break,
          _ = ticker.tick() => {
            let beat = Bytes::from(Utc::now().timestamp().to_string());
            if let Err(e) = hb_store.put(Bucket::Heartbeat, &hb_entity, beat).await {
              warn!(processor = %hb_entity, store = hb_store.name(), error = %e, "Failed to publish heartbeat");
            }
          }
        }
      }
    });

    Arc::new(Self {
      entity,
      store,
      heads: Mutex::new(HashMap::new()),
      shutdown,
      heartbeat: Mutex::new(Some(handle)),
    })
  }

  /// Processor name this publisher writes under.
  pub fn entity(&self) -> &str {
    &self.entity
  }

  fn timeline_key(&self, partition: u16) -> String {
    format!("{}:{}", self.entity, partition)
  }
}

#[async_trait]
impl Publisher for StorePublisher {
  async fn publish_watermark(
    &self,
    watermark: Watermark,
    offset: i64,
    partition: u16,
  ) -> Result<()> {
    let mut heads = self.heads.lock().await;
    if let Some(head) = heads.get(&partition) {
      if watermark.as_millis() < head.watermark {
        debug!(
          processor = %self.entity,
          partition,
          head = head.watermark,
          watermark = watermark.as_millis(),
          "Skipping watermark older than head"
        );
        return Ok(());
      }
    }
    let wmb = Wmb {
      idle: false,
      offset,
      watermark: watermark.as_millis(),
      partition,
    };
    self
      .store
      .put(
        Bucket::OffsetTimeline,
        &self.timeline_key(partition),
        wmb.encode()?,
      )
      .await?;
    heads.insert(partition, wmb);
    Ok(())
  }

  async fn head_watermark(&self, partition: u16) -> Watermark {
    self
      .heads
      .lock()
      .await
      .get(&partition)
      .map(|wmb| Watermark(wmb.watermark))
      .unwrap_or(Watermark::INIT)
  }

  async fn close(&self) -> Result<()> {
    self.shutdown.cancel();
    let handle = self.heartbeat.lock().await.take();
    if let Some(handle) = handle {
      handle
        .await
        .map_err(|e| Error::Watermark(format!("heartbeat task panicked: {}", e)))?;
    }

    let partitions: Vec<u16> = self.heads.lock().await.keys().copied().collect();
    for partition in partitions {
      self
        .store
        .delete(Bucket::OffsetTimeline, &self.timeline_key(partition))
        .await?;
    }
    self.store.delete(Bucket::Heartbeat, &self.entity).await
  }
}
