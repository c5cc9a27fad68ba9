//! # Forwarder Lifecycle Manager
//!
//! [`MapUdfProcessor`] runs a map vertex: one forwarder per input partition,
//! all sharing the same writers, handler and watermark components.
//!
//! ## States
//!
//! 1. **Provisioning**: buffers and watermark components, the streaming flag,
//!    the handler and its readiness, the metrics server, then one router and
//!    one forwarder per partition. Any failure here is returned and no worker
//!    is started.
//! 2. **Running**: one worker per partition. Each worker starts its forwarder
//!    and observes the forwarder's stopped signal in a nested task.
//! 3. **Draining**: on cancellation every worker stops its forwarder and
//!    waits for the observer.
//! 4. **Teardown**: once every worker has joined, writers are closed, then
//!    processor managers, publishers and stores. Errors are logged only.
//! 5. **Terminal**: metrics pollers stop, the handler connection is released
//!    and `start` returns `Ok`.

use crate::config::VertexInstance;
use crate::error::{Error, Result};
use crate::forward::{ForwardOptions, InterStepDataForward};
use crate::isb::WriterMap;
use crate::metrics::{MetricsServer, MetricsShutdown};
use crate::provision::{
  BufferBackend, IsbSvcType, Provisioned, WatermarkComponents, WatermarkOptions, provision_with,
};
use crate::router::OutputRouter;
use crate::udf::{UdfClientFactory, UdfHandler};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs every partition of a map vertex.
pub struct MapUdfProcessor {
  isbsvc: IsbSvcType,
  vertex_instance: Arc<VertexInstance>,
  backend: Arc<dyn BufferBackend>,
  udf_factory: Arc<dyn UdfClientFactory>,
  metrics_addr: Option<SocketAddr>,
  watermark_options: WatermarkOptions,
  retry_interval: Option<Duration>,
}

/// Resources shared by every partition; released together.
struct Shared {
  writers: Arc<WriterMap>,
  watermark: WatermarkComponents,
  handler: Option<UdfHandler>,
  metrics: Option<MetricsShutdown>,
}

impl Shared {
  /// Teardown followed by the terminal steps.
  async fn release(self) {
    for (to_vertex, partitions) in self.writers.iter() {
      for writer in partitions {
        if let Err(e) = writer.close().await {
          error!(to_vertex = %to_vertex, buffer = writer.name(), error = %e, "Failed to close writer");
        }
      }
    }
    self.watermark.close().await;
    if let Some(metrics) = self.metrics {
      metrics.shutdown().await;
    }
    if let Some(handler) = self.handler {
      if let Err(e) = handler.close_conn().await {
        warn!(error = %e, "Failed to close handler connection");
      }
    }
  }
}

impl MapUdfProcessor {
  /// Creates a processor for one vertex replica.
  pub fn new(
    isbsvc: IsbSvcType,
    vertex_instance: Arc<VertexInstance>,
    backend: Arc<dyn BufferBackend>,
    udf_factory: Arc<dyn UdfClientFactory>,
  ) -> Self {
    Self {
      isbsvc,
      vertex_instance,
      backend,
      udf_factory,
      metrics_addr: None,
      watermark_options: WatermarkOptions::default(),
      retry_interval: None,
    }
  }

  /// Serves metrics on `addr`. Metrics are not exported when `None`.
  #[must_use]
  pub fn with_metrics_addr(mut self, addr: Option<SocketAddr>) -> Self {
    self.metrics_addr = addr;
    self
  }

  /// Sets the watermark settings used while provisioning.
  #[must_use]
  pub fn with_watermark_options(mut self, options: WatermarkOptions) -> Self {
    self.watermark_options = options;
    self
  }

  /// Sets the forwarders' pause between retries.
  #[must_use]
  pub fn with_retry_interval(mut self, interval: Duration) -> Self {
    self.retry_interval = Some(interval);
    self
  }

  /// Runs the vertex until `cancel` fires and every partition has quiesced.
  ///
  /// # Errors
  ///
  /// Only startup failures are returned; once workers run, `start` returns
  /// `Ok` after teardown.
  pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
    let vertex = &self.vertex_instance.vertex;
    let partitions = self.vertex_instance.owned_buffers();
    let to_vertices = vertex.to_vertices();

    let Provisioned {
      readers,
      writers,
      watermark,
    } = provision_with(
      self.isbsvc,
      &self.vertex_instance,
      self.backend.as_ref(),
      &self.watermark_options,
    )
    .await?;
    let mut shared = Shared {
      writers: Arc::new(writers),
      watermark,
      handler: None,
      metrics: None,
    };

    let streaming = match vertex.map_udf_stream_enabled() {
      Ok(streaming) => streaming,
      Err(e) => {
        shared.release().await;
        return Err(e);
      }
    };

    let handler = match self.udf_factory.handler(streaming) {
      Ok(handler) => handler,
      Err(e) => {
        shared.release().await;
        return Err(Error::Udf(format!("failed to create map client: {}", e)));
      }
    };
    shared.handler = Some(handler.clone());
    if let Err(e) = handler.wait_until_ready(&cancel).await {
      shared.release().await;
      return Err(Error::Udf(format!("failed on map UDF readiness check: {}", e)));
    }

    let metrics = MetricsServer::new(vertex.name.clone())
      .with_addr(self.metrics_addr)
      .with_health_checker(handler.health_checker())
      .with_lag_readers(readers.clone());
    match metrics.start(&cancel) {
      Ok(shutdown) => shared.metrics = Some(shutdown),
      Err(e) => {
        shared.release().await;
        return Err(e);
      }
    }

    let mut options = ForwardOptions::default().with_udf_streaming(streaming);
    if let Some(batch) = vertex.read_batch_size() {
      options = options
        .with_read_batch_size(batch)
        .with_udf_concurrency(batch);
    }
    if let Some(interval) = self.retry_interval {
      options = options.with_retry_interval(interval);
    }

    let edges = vertex.to_edges();
    let publishers = Arc::new(shared.watermark.publishers.clone());
    let mut forwarders = Vec::with_capacity(readers.len());
    for (reader, partition) in readers.iter().zip(partitions.iter()) {
      let router = OutputRouter::new(Arc::clone(&edges));
      let forwarder = InterStepDataForward::new(
        vertex.name.clone(),
        Arc::clone(reader),
        Arc::clone(&shared.writers),
        Box::new(router),
        handler.clone(),
        Arc::clone(&shared.watermark.fetcher),
        Arc::clone(&publishers),
        options.clone(),
      );
      match forwarder {
        Ok(forwarder) => forwarders.push((partition.clone(), forwarder)),
        Err(e) => {
          shared.release().await;
          return Err(e);
        }
      }
    }

    let mut workers = JoinSet::new();
    for (partition, forwarder) in forwarders {
      let cancel = cancel.clone();
      let isbsvc = self.isbsvc;
      let to_vertices = to_vertices.clone();
      workers.spawn(async move {
        info!(isbsvc = %isbsvc, from = %partition, to = ?to_vertices, "Start processing udf messages");
        let (handle, stopped) = forwarder.start();

        let observed = partition.clone();
        let observer = tokio::spawn(async move {
          let _ = stopped.await;
          info!(
            "Forwarder stopped, exiting udf data processor for partition {}...",
            observed
          );
        });

        cancel.cancelled().await;
        info!(partition = %partition, "SIGTERM, exiting inside partition...");
        handle.stop();
        if let Err(e) = observer.await {
          error!(partition = %partition, error = %e, "Forwarder observer failed");
        }
        info!(partition = %partition, "Exited for partition...");
      });
    }

    while let Some(joined) = workers.join_next().await {
      if let Err(e) = joined {
        error!(error = %e, "Partition worker failed");
      }
    }

    shared.release().await;
    info!(vertex = %vertex.name, "All udf data processors exited...");
    Ok(())
  }
}
