//! Builders for watermark progressors.

use super::fetch::{Fetcher, NoOpFetcher};
use super::processor::{ProcessorManager, ProcessorManagerConfig};
use super::publish::{NoOpPublisher, Publisher, StorePublisher};
use super::store::WatermarkStore;
use crate::config::VertexInstance;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Interval between heartbeats of a publisher.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Publishers keyed by destination vertex name.
pub type PublisherMap = HashMap<String, Arc<dyn Publisher>>;

/// Fetcher and publishers that do nothing, one publisher per destination.
pub fn build_noop_watermark_progressors(to_vertices: &[String]) -> (Arc<dyn Fetcher>, PublisherMap) {
  let publishers = to_vertices
    .iter()
    .map(|name| (name.clone(), Arc::new(NoOpPublisher) as Arc<dyn Publisher>))
    .collect();
  (Arc::new(NoOpFetcher), publishers)
}

/// One processor manager per upstream vertex, watching that edge's store.
pub fn build_processor_managers(
  from_stores: HashMap<String, Arc<dyn WatermarkStore>>,
  config: &ProcessorManagerConfig,
) -> HashMap<String, Arc<ProcessorManager>> {
  from_stores
    .into_iter()
    .map(|(from_vertex, store)| {
      let manager = ProcessorManager::start(from_vertex.clone(), store, config.clone());
      (from_vertex, manager)
    })
    .collect()
}

/// One publisher per destination vertex, writing into that edge's store under
/// this replica's processor name.
pub fn build_publishers_from_stores(
  vertex_instance: &VertexInstance,
  to_stores: &HashMap<String, Arc<dyn WatermarkStore>>,
  heartbeat_interval: Duration,
) -> PublisherMap {
  let entity = vertex_instance.processor_entity();
  to_stores
    .iter()
    .map(|(to_vertex, store)| {
      let publisher = StorePublisher::start(entity.clone(), Arc::clone(store), heartbeat_interval);
      (to_vertex.clone(), publisher as Arc<dyn Publisher>)
    })
    .collect()
}
