//! Map vertex process: loads its configuration from the environment and runs
//! until SIGINT or SIGTERM.

use std::sync::Arc;
use streamweave_vertex::config::{RuntimeSettings, VertexInstance};
use streamweave_vertex::processor::MapUdfProcessor;
use streamweave_vertex::provision::InMemoryBackend;
use streamweave_vertex::udf::http::HttpUdfClientFactory;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
    .init();

  let vertex = Arc::new(VertexInstance::from_env()?);
  let settings = RuntimeSettings::from_env()?;
  settings.check_read_batch_size(&vertex.vertex)?;
  info!(
    vertex = %vertex.vertex.name,
    pipeline = %vertex.vertex.pipeline_name,
    replica = vertex.replica,
    isbsvc = %settings.isbsvc_type,
    "Starting map vertex"
  );

  let cancel = CancellationToken::new();
  tokio::spawn(shutdown_on_signal(cancel.clone()));

  let processor = MapUdfProcessor::new(
    settings.isbsvc_type,
    vertex,
    Arc::new(InMemoryBackend::new(settings.buffer_capacity)),
    Arc::new(HttpUdfClientFactory::from_settings(&settings)),
  )
  .with_metrics_addr(settings.metrics_addr);

  if let Err(e) = processor.start(cancel).await {
    error!(error = %e, "Map vertex failed to start");
    return Err(e.into());
  }
  Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{SignalKind, signal};
    if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
      tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
      }
      info!("Received shutdown signal");
      cancel.cancel();
      return;
    }
  }
  let _ = tokio::signal::ctrl_c().await;
  info!("Received shutdown signal");
  cancel.cancel();
}
