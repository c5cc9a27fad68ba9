//! # Auxiliary Resource Provisioner
//!
//! Builds everything a vertex run needs before any forwarder starts: one
//! reader per input partition, writers for every destination partition, and
//! the watermark components.
//!
//! | Backend     | Watermark                                            |
//! |-------------|------------------------------------------------------|
//! | `redis`     | no-op fetcher and publishers                         |
//! | `jetstream` | no-op when disabled on the vertex, otherwise store-backed |
//!
//! Store-backed watermarks are built in dependency order: processor managers
//! over the incoming edge stores, the edge fetcher set over the managers,
//! the outgoing edge stores, then one publisher per outgoing store.
//!
//! The actual buffers and stores come from a [`BufferBackend`].
//! [`InMemoryBackend`] keeps them in process.

use crate::config::VertexInstance;
use crate::error::{Error, Result};
use crate::isb::simple::SimpleBuffer;
use crate::isb::{BufferReader, BufferWriter, WriterMap};
use crate::watermark::fetch::{EdgeFetcherSet, Fetcher};
use crate::watermark::generic::{
  DEFAULT_HEARTBEAT_INTERVAL, PublisherMap, build_noop_watermark_progressors,
  build_processor_managers, build_publishers_from_stores,
};
use crate::watermark::processor::{ProcessorManager, ProcessorManagerConfig};
use crate::watermark::store::{InMemoryStore, WatermarkStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Buffer backend technology.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsbSvcType {
  /// Redis streams; no watermark support.
  Redis,
  /// JetStream; watermarks through KV stores.
  JetStream,
}

impl fmt::Display for IsbSvcType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      IsbSvcType::Redis => write!(f, "redis"),
      IsbSvcType::JetStream => write!(f, "jetstream"),
    }
  }
}

impl FromStr for IsbSvcType {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "redis" => Ok(IsbSvcType::Redis),
      "jetstream" => Ok(IsbSvcType::JetStream),
      other => Err(Error::Config(format!("unrecognized isbsvc type {:?}", other))),
    }
  }
}

/// Readers and writers of one vertex run.
pub struct BufferIo {
  /// One reader per input partition, in partition order.
  pub readers: Vec<Arc<dyn BufferReader>>,
  /// Writers per destination vertex.
  pub writers: WriterMap,
}

/// Source of buffers and watermark stores.
#[async_trait]
pub trait BufferBackend: Send + Sync {
  /// Builds the readers and writers of `vertex`.
  async fn build_buffer_io(&self, isbsvc: IsbSvcType, vertex: &VertexInstance) -> Result<BufferIo>;

  /// Builds one store per incoming edge, keyed by upstream vertex name.
  async fn build_from_vertex_watermark_stores(
    &self,
    vertex: &VertexInstance,
  ) -> Result<HashMap<String, Arc<dyn WatermarkStore>>>;

  /// Builds one store per outgoing edge, keyed by destination vertex name.
  async fn build_to_vertex_watermark_stores(
    &self,
    vertex: &VertexInstance,
  ) -> Result<HashMap<String, Arc<dyn WatermarkStore>>>;
}

/// Watermark settings used while provisioning.
#[derive(Clone, Debug, Default)]
pub struct WatermarkOptions {
  /// Processor manager settings.
  pub processor_manager: ProcessorManagerConfig,
  /// Publisher heartbeat interval; [`DEFAULT_HEARTBEAT_INTERVAL`] if unset.
  pub heartbeat_interval: Option<Duration>,
}

/// Watermark fetcher, publishers and the resources behind them.
pub struct WatermarkComponents {
  /// Fetcher shared by every forwarder.
  pub fetcher: Arc<dyn Fetcher>,
  /// Publishers shared by every forwarder.
  pub publishers: PublisherMap,
  /// Processor managers, keyed by upstream vertex. Each owns its store.
  pub processor_managers: HashMap<String, Arc<ProcessorManager>>,
  /// Outgoing edge stores, keyed by destination vertex.
  pub stores: HashMap<String, Arc<dyn WatermarkStore>>,
}

impl WatermarkComponents {
  /// No-op fetcher and publishers for `vertex`.
  pub fn noop(vertex: &VertexInstance) -> Self {
    let (fetcher, publishers) = build_noop_watermark_progressors(&vertex.vertex.to_vertices());
    Self {
      fetcher,
      publishers,
      processor_managers: HashMap::new(),
      stores: HashMap::new(),
    }
  }

  /// Closes processor managers, then publishers, then stores. Errors are
  /// logged.
  pub async fn close(&self) {
    for (from_vertex, manager) in &self.processor_managers {
      if let Err(e) = manager.close().await {
        error!(from_vertex = %from_vertex, error = %e, "Failed to close processor manager");
      }
    }
    for (to_vertex, publisher) in &self.publishers {
      if let Err(e) = publisher.close().await {
        error!(to_vertex = %to_vertex, error = %e, "Failed to close the watermark publisher");
      }
    }
    for (to_vertex, store) in &self.stores {
      if let Err(e) = store.close().await {
        warn!(to_vertex = %to_vertex, store = store.name(), error = %e, "Failed to close watermark store");
      }
    }
  }
}

/// Everything built for one vertex run.
pub struct Provisioned {
  /// One reader per input partition, in partition order.
  pub readers: Vec<Arc<dyn BufferReader>>,
  /// Writers per destination vertex.
  pub writers: WriterMap,
  /// Watermark components.
  pub watermark: WatermarkComponents,
}

/// Provisions buffers and watermark components with default watermark
/// options.
pub async fn provision(
  isbsvc: IsbSvcType,
  vertex: &VertexInstance,
  backend: &dyn BufferBackend,
) -> Result<Provisioned> {
  provision_with(isbsvc, vertex, backend, &WatermarkOptions::default()).await
}

/// Provisions buffers and watermark components.
///
/// On failure, whatever was already started is closed again.
pub async fn provision_with(
  isbsvc: IsbSvcType,
  vertex: &VertexInstance,
  backend: &dyn BufferBackend,
  options: &WatermarkOptions,
) -> Result<Provisioned> {
  let watermark = match isbsvc {
    IsbSvcType::Redis => WatermarkComponents::noop(vertex),
    IsbSvcType::JetStream if !vertex.vertex.watermark_enabled() => WatermarkComponents::noop(vertex),
    IsbSvcType::JetStream => build_watermark(vertex, backend, options).await?,
  };

  let io = match backend.build_buffer_io(isbsvc, vertex).await {
    Ok(io) => io,
    Err(e) => {
      watermark.close().await;
      return Err(Error::Provision(format!("failed to build buffer io: {}", e)));
    }
  };

  let expected = vertex.vertex.partition_count() as usize;
  if io.readers.len() != expected {
    watermark.close().await;
    return Err(Error::Provision(format!(
      "expected {} readers, backend built {}",
      expected,
      io.readers.len()
    )));
  }

  info!(
    isbsvc = %isbsvc,
    vertex = %vertex.vertex.name,
    readers = io.readers.len(),
    destinations = io.writers.len(),
    watermark = !watermark.processor_managers.is_empty() || !watermark.stores.is_empty(),
    "Provisioned vertex resources"
  );

  Ok(Provisioned {
    readers: io.readers,
    writers: io.writers,
    watermark,
  })
}

async fn build_watermark(
  vertex: &VertexInstance,
  backend: &dyn BufferBackend,
  options: &WatermarkOptions,
) -> Result<WatermarkComponents> {
  let from_stores = backend
    .build_from_vertex_watermark_stores(vertex)
    .await
    .map_err(|e| Error::Provision(format!("failed to build processor manager: {}", e)))?;
  let processor_managers = build_processor_managers(from_stores, &options.processor_manager);
  let fetcher: Arc<dyn Fetcher> = Arc::new(EdgeFetcherSet::new(
    processor_managers.clone(),
    vertex.vertex.partition_count(),
  ));

  let stores = match backend.build_to_vertex_watermark_stores(vertex).await {
    Ok(stores) => stores,
    Err(e) => {
      for manager in processor_managers.values() {
        let _ = manager.close().await;
      }
      return Err(Error::Provision(format!(
        "failed to build watermark stores: {}",
        e
      )));
    }
  };
  let publishers = build_publishers_from_stores(
    vertex,
    &stores,
    options.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
  );

  Ok(WatermarkComponents {
    fetcher,
    publishers,
    processor_managers,
    stores,
  })
}

/// Backend keeping buffers and stores in process.
///
/// Buffers and stores are created on first use and looked up by name after
/// that, so two vertices sharing one backend see the same objects.
pub struct InMemoryBackend {
  capacity: usize,
  read_timeout: Option<Duration>,
  buffers: Mutex<HashMap<String, Arc<SimpleBuffer>>>,
  stores: Mutex<HashMap<String, Arc<InMemoryStore>>>,
}

impl InMemoryBackend {
  /// Creates a backend whose buffers hold `capacity` records each.
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      read_timeout: None,
      buffers: Mutex::new(HashMap::new()),
      stores: Mutex::new(HashMap::new()),
    }
  }

  /// Sets the read timeout of every buffer created afterwards.
  #[must_use]
  pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
    self.read_timeout = Some(timeout);
    self
  }

  /// Returns the buffer partition `name`, creating it if needed.
  pub async fn buffer(&self, name: &str, partition_idx: u16) -> Arc<SimpleBuffer> {
    let mut buffers = self.buffers.lock().await;
    let buffer = buffers.entry(name.to_string()).or_insert_with(|| {
      let buffer = SimpleBuffer::new(name, partition_idx, self.capacity);
      let buffer = match self.read_timeout {
        Some(timeout) => buffer.with_read_timeout(timeout),
        None => buffer,
      };
      Arc::new(buffer)
    });
    Arc::clone(buffer)
  }

  /// Returns the store `name`, creating it if needed.
  pub async fn store(&self, name: &str) -> Arc<InMemoryStore> {
    let mut stores = self.stores.lock().await;
    Arc::clone(
      stores
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(InMemoryStore::new(name))),
    )
  }

  /// Names of every buffer created so far, sorted.
  pub async fn buffer_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.buffers.lock().await.keys().cloned().collect();
    names.sort();
    names
  }

  /// Names of every store created so far, sorted.
  pub async fn store_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.stores.lock().await.keys().cloned().collect();
    names.sort();
    names
  }
}

#[async_trait]
impl BufferBackend for InMemoryBackend {
  async fn build_buffer_io(&self, _isbsvc: IsbSvcType, vertex: &VertexInstance) -> Result<BufferIo> {
    let mut readers: Vec<Arc<dyn BufferReader>> = Vec::new();
    for (idx, name) in vertex.owned_buffers().iter().enumerate() {
      readers.push(self.buffer(name, idx as u16).await);
    }

    let mut writers = WriterMap::new();
    for (to_vertex, names) in vertex.to_buffers() {
      let mut partitions: Vec<Arc<dyn BufferWriter>> = Vec::with_capacity(names.len());
      for (idx, name) in names.iter().enumerate() {
        partitions.push(self.buffer(name, idx as u16).await);
      }
      writers.insert(to_vertex, partitions);
    }
    Ok(BufferIo { readers, writers })
  }

  async fn build_from_vertex_watermark_stores(
    &self,
    vertex: &VertexInstance,
  ) -> Result<HashMap<String, Arc<dyn WatermarkStore>>> {
    let mut stores: HashMap<String, Arc<dyn WatermarkStore>> = HashMap::new();
    for edge in &vertex.vertex.spec.from_edges {
      let name = vertex.edge_store_name(&edge.from, &vertex.vertex.name);
      stores.insert(edge.from.clone(), self.store(&name).await);
    }
    Ok(stores)
  }

  async fn build_to_vertex_watermark_stores(
    &self,
    vertex: &VertexInstance,
  ) -> Result<HashMap<String, Arc<dyn WatermarkStore>>> {
    let mut stores: HashMap<String, Arc<dyn WatermarkStore>> = HashMap::new();
    for edge in &vertex.vertex.spec.to_edges {
      let name = vertex.edge_store_name(&vertex.vertex.name, &edge.to);
      stores.insert(edge.to.clone(), self.store(&name).await);
    }
    Ok(stores)
  }
}
