//! End-to-end lifecycle tests for the map vertex processor.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamweave_vertex::config::{MAP_STREAM_ANNOTATION, Vertex, VertexInstance};
use streamweave_vertex::error::{Error, Result};
use streamweave_vertex::isb::{BufferReader, BufferWriter};
use streamweave_vertex::message::{Message, Offset, ReadMessage};
use streamweave_vertex::processor::MapUdfProcessor;
use streamweave_vertex::provision::{BufferBackend, BufferIo, InMemoryBackend, IsbSvcType};
use streamweave_vertex::topology::{Edge, VertexType};
use streamweave_vertex::udf::{HealthChecker, MapApplier, MapStreamApplier, UdfClientFactory};
use streamweave_vertex::watermark::store::{Bucket, WatermarkStore};
use tokio_util::sync::CancellationToken;

type Events = Arc<Mutex<Vec<String>>>;

fn push(events: &Events, event: String) {
  events.lock().unwrap().push(event);
}

struct RecordingReader {
  inner: Arc<dyn BufferReader>,
  events: Events,
}

#[async_trait]
impl BufferReader for RecordingReader {
  fn name(&self) -> &str {
    self.inner.name()
  }

  fn partition_idx(&self) -> u16 {
    self.inner.partition_idx()
  }

  async fn read(&self, count: usize) -> Result<Vec<ReadMessage>> {
    self.inner.read(count).await
  }

  async fn ack(&self, offsets: &[Offset]) -> Result<()> {
    self.inner.ack(offsets).await
  }

  async fn pending(&self) -> Result<Option<i64>> {
    self.inner.pending().await
  }

  async fn close(&self) -> Result<()> {
    push(&self.events, format!("close reader {}", self.name()));
    self.inner.close().await
  }
}

struct RecordingWriter {
  inner: Arc<dyn BufferWriter>,
  events: Events,
}

#[async_trait]
impl BufferWriter for RecordingWriter {
  fn name(&self) -> &str {
    self.inner.name()
  }

  fn partition_idx(&self) -> u16 {
    self.inner.partition_idx()
  }

  async fn write(&self, messages: Vec<Message>) -> Result<Vec<Offset>> {
    self.inner.write(messages).await
  }

  async fn close(&self) -> Result<()> {
    push(&self.events, format!("close writer {}", self.name()));
    self.inner.close().await
  }
}

struct RecordingStore {
  inner: Arc<dyn WatermarkStore>,
  events: Events,
  fails: bool,
}

impl RecordingStore {
  fn failure(&self, op: &str) -> Result<()> {
    if self.fails {
      return Err(Error::Watermark(format!("{} {} refused", op, self.name())));
    }
    Ok(())
  }
}

#[async_trait]
impl WatermarkStore for RecordingStore {
  fn name(&self) -> &str {
    self.inner.name()
  }

  async fn put(&self, bucket: Bucket, key: &str, value: Bytes) -> Result<()> {
    self.inner.put(bucket, key, value).await
  }

  async fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Bytes>> {
    self.inner.get(bucket, key).await
  }

  async fn delete(&self, bucket: Bucket, key: &str) -> Result<()> {
    push(&self.events, format!("delete {}", self.name()));
    self.failure("delete")?;
    self.inner.delete(bucket, key).await
  }

  async fn keys(&self, bucket: Bucket) -> Result<Vec<String>> {
    self.inner.keys(bucket).await
  }

  async fn close(&self) -> Result<()> {
    push(&self.events, format!("close store {}", self.name()));
    self.failure("close")?;
    self.inner.close().await
  }
}

struct RecordingBackend {
  inner: InMemoryBackend,
  events: Events,
  failing_stores: Vec<String>,
}

impl RecordingBackend {
  fn new(events: Events) -> Self {
    Self {
      inner: InMemoryBackend::new(1_000).with_read_timeout(Duration::from_millis(10)),
      events,
      failing_stores: Vec::new(),
    }
  }

  /// Stores named here fail every delete and close.
  fn with_failing_stores(mut self, names: &[&str]) -> Self {
    self.failing_stores = names.iter().map(|n| n.to_string()).collect();
    self
  }

  fn wrap_stores(
    &self,
    stores: HashMap<String, Arc<dyn WatermarkStore>>,
  ) -> HashMap<String, Arc<dyn WatermarkStore>> {
    stores
      .into_iter()
      .map(|(vertex, store)| {
        let fails = self.failing_stores.iter().any(|n| n == store.name());
        let wrapped: Arc<dyn WatermarkStore> = Arc::new(RecordingStore {
          inner: store,
          events: Arc::clone(&self.events),
          fails,
        });
        (vertex, wrapped)
      })
      .collect()
  }
}

#[async_trait]
impl BufferBackend for RecordingBackend {
  async fn build_buffer_io(&self, isbsvc: IsbSvcType, vertex: &VertexInstance) -> Result<BufferIo> {
    let io = self.inner.build_buffer_io(isbsvc, vertex).await?;
    let readers = io
      .readers
      .into_iter()
      .map(|inner| {
        Arc::new(RecordingReader {
          inner,
          events: Arc::clone(&self.events),
        }) as Arc<dyn BufferReader>
      })
      .collect();
    let writers = io
      .writers
      .into_iter()
      .map(|(vertex, partitions)| {
        let partitions = partitions
          .into_iter()
          .map(|inner| {
            Arc::new(RecordingWriter {
              inner,
              events: Arc::clone(&self.events),
            }) as Arc<dyn BufferWriter>
          })
          .collect();
        (vertex, partitions)
      })
      .collect();
    Ok(BufferIo { readers, writers })
  }

  async fn build_from_vertex_watermark_stores(
    &self,
    vertex: &VertexInstance,
  ) -> Result<HashMap<String, Arc<dyn WatermarkStore>>> {
    let stores = self.inner.build_from_vertex_watermark_stores(vertex).await?;
    Ok(self.wrap_stores(stores))
  }

  async fn build_to_vertex_watermark_stores(
    &self,
    vertex: &VertexInstance,
  ) -> Result<HashMap<String, Arc<dyn WatermarkStore>>> {
    let stores = self.inner.build_to_vertex_watermark_stores(vertex).await?;
    Ok(self.wrap_stores(stores))
  }
}

/// Passes every record through unchanged.
struct Echo {
  ready: bool,
  events: Events,
}

#[async_trait]
impl HealthChecker for Echo {
  async fn is_healthy(&self) -> Result<()> {
    if self.ready {
      Ok(())
    } else {
      Err(Error::Udf("not serving".into()))
    }
  }
}

#[async_trait]
impl MapApplier for Echo {
  async fn wait_until_ready(&self, _cancel: &CancellationToken) -> Result<()> {
    self.is_healthy().await
  }

  async fn apply_map(&self, message: &ReadMessage) -> Result<Vec<Message>> {
    Ok(vec![message.message.clone()])
  }

  async fn close_conn(&self) -> Result<()> {
    push(&self.events, "close conn".to_string());
    Ok(())
  }
}

struct EchoFactory {
  ready: bool,
  events: Events,
}

impl UdfClientFactory for EchoFactory {
  fn map_client(&self) -> Result<Arc<dyn MapApplier>> {
    Ok(Arc::new(Echo {
      ready: self.ready,
      events: Arc::clone(&self.events),
    }))
  }

  fn map_stream_client(&self) -> Result<Arc<dyn MapStreamApplier>> {
    Err(Error::Udf("streaming is not supported".into()))
  }
}

fn vertex_instance(partitions: u16, annotations: HashMap<String, String>) -> Arc<VertexInstance> {
  let mut vertex = Vertex {
    name: "map".to_string(),
    pipeline_name: "p".to_string(),
    annotations,
    ..Default::default()
  };
  vertex.spec.partitions = Some(partitions);
  vertex.spec.from_edges = vec![
    Edge::new("in", "map", VertexType::MapUdf, partitions).with_from_vertex_type(VertexType::Source),
  ];
  vertex.spec.to_edges = vec![Edge::new("map", "sink", VertexType::Sink, 2)];
  Arc::new(VertexInstance::new(vertex, "map-0", 0).unwrap())
}

async fn feed(backend: &RecordingBackend, buffer: &str, idx: u16, values: &[&str]) {
  let messages = values.iter().map(|v| Message::new(v.to_string())).collect();
  BufferWriter::write(backend.inner.buffer(buffer, idx).await.as_ref(), messages)
    .await
    .unwrap();
}

async fn sink_total(backend: &RecordingBackend) -> usize {
  let mut total = 0;
  for idx in 0..2u16 {
    total += backend.inner.buffer(&format!("p-sink-{}", idx), idx).await.unread_len().await;
  }
  total
}

fn position(events: &[String], pred: impl Fn(&str) -> bool) -> Vec<usize> {
  events
    .iter()
    .enumerate()
    .filter(|(_, e)| pred(e))
    .map(|(i, _)| i)
    .collect()
}

#[tokio::test]
async fn test_two_partitions_drain_then_tear_down_in_order() {
  let events: Events = Arc::default();
  let backend = Arc::new(RecordingBackend::new(Arc::clone(&events)));
  feed(&backend, "p-map-0", 0, &["a", "b", "c"]).await;
  feed(&backend, "p-map-1", 1, &["d", "e"]).await;

  let processor = Arc::new(
    MapUdfProcessor::new(
      IsbSvcType::JetStream,
      vertex_instance(2, HashMap::new()),
      backend.clone(),
      Arc::new(EchoFactory {
        ready: true,
        events: Arc::clone(&events),
      }),
    )
    .with_retry_interval(Duration::from_millis(5)),
  );
  let cancel = CancellationToken::new();
  let run = tokio::spawn({
    let processor = Arc::clone(&processor);
    let cancel = cancel.clone();
    async move { processor.start(cancel).await }
  });

  for _ in 0..400 {
    if sink_total(&backend).await == 5 {
      break;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  assert_eq!(sink_total(&backend).await, 5);
  assert!(events.lock().unwrap().is_empty());

  cancel.cancel();
  tokio::time::timeout(Duration::from_secs(5), run)
    .await
    .expect("processor did not quiesce")
    .unwrap()
    .unwrap();

  let events = events.lock().unwrap().clone();
  let readers = position(&events, |e| e.starts_with("close reader"));
  let writers = position(&events, |e| e.starts_with("close writer"));
  let from_store = position(&events, |e| e == "close store p-in-map");
  let publisher_deletes = position(&events, |e| e == "delete p-map-sink");
  let to_store = position(&events, |e| e == "close store p-map-sink");
  let conn = position(&events, |e| e == "close conn");

  assert_eq!(readers.len(), 2, "{:?}", events);
  assert_eq!(writers.len(), 2, "{:?}", events);
  assert_eq!(from_store.len(), 1, "{:?}", events);
  assert!(!publisher_deletes.is_empty(), "{:?}", events);
  assert_eq!(to_store.len(), 1, "{:?}", events);
  assert_eq!(conn.len(), 1, "{:?}", events);

  assert!(readers.iter().max() < writers.iter().min(), "{:?}", events);
  assert!(writers.iter().max() < from_store.iter().min(), "{:?}", events);
  assert!(from_store[0] < publisher_deletes[0], "{:?}", events);
  assert!(publisher_deletes.iter().max() < to_store.iter().min(), "{:?}", events);
  assert_eq!(conn[0], events.len() - 1, "{:?}", events);

  for idx in 0..2u16 {
    let input = backend.inner.buffer(&format!("p-map-{}", idx), idx).await;
    assert!(input.is_closed());
  }
  assert_eq!(
    backend.inner.buffer("p-map-0", 0).await.acked_total().await,
    3
  );
  assert_eq!(
    backend.inner.buffer("p-map-1", 1).await.acked_total().await,
    2
  );
}

#[tokio::test]
async fn test_failed_store_teardown_is_logged_and_shutdown_completes() {
  let events: Events = Arc::default();
  let backend = Arc::new(
    RecordingBackend::new(Arc::clone(&events)).with_failing_stores(&["p-in-map", "p-map-sink"]),
  );
  feed(&backend, "p-map-0", 0, &["a"]).await;

  let processor = MapUdfProcessor::new(
    IsbSvcType::JetStream,
    vertex_instance(1, HashMap::new()),
    backend.clone(),
    Arc::new(EchoFactory {
      ready: true,
      events: Arc::clone(&events),
    }),
  )
  .with_retry_interval(Duration::from_millis(5));
  let cancel = CancellationToken::new();
  let stopper = cancel.clone();
  let watcher = Arc::clone(&backend);
  tokio::spawn(async move {
    for _ in 0..400 {
      if sink_total(&watcher).await == 1 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    stopper.cancel();
  });

  tokio::time::timeout(Duration::from_secs(5), processor.start(cancel))
    .await
    .expect("processor did not quiesce")
    .unwrap();
  assert_eq!(sink_total(&backend).await, 1);

  let events = events.lock().unwrap().clone();
  assert!(events.iter().any(|e| e == "close store p-in-map"), "{:?}", events);
  assert!(events.iter().any(|e| e == "delete p-map-sink"), "{:?}", events);
  assert!(events.iter().any(|e| e == "close store p-map-sink"), "{:?}", events);
  assert_eq!(events.last().map(String::as_str), Some("close conn"), "{:?}", events);
  assert!(backend.inner.buffer("p-map-0", 0).await.is_closed());
}

#[tokio::test]
async fn test_redis_runs_without_watermark_stores() {
  let events: Events = Arc::default();
  let backend = Arc::new(RecordingBackend::new(Arc::clone(&events)));
  feed(&backend, "p-map-0", 0, &["a"]).await;

  let processor = MapUdfProcessor::new(
    IsbSvcType::Redis,
    vertex_instance(1, HashMap::new()),
    backend.clone(),
    Arc::new(EchoFactory {
      ready: true,
      events: Arc::clone(&events),
    }),
  );
  let cancel = CancellationToken::new();
  let stopper = cancel.clone();
  let watcher = Arc::clone(&backend);
  tokio::spawn(async move {
    for _ in 0..400 {
      if sink_total(&watcher).await == 1 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    stopper.cancel();
  });

  tokio::time::timeout(Duration::from_secs(5), processor.start(cancel))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(sink_total(&backend).await, 1);
  assert!(backend.inner.store_names().await.is_empty());
}

#[tokio::test]
async fn test_handler_not_ready_fails_before_any_worker() {
  let events: Events = Arc::default();
  let backend = Arc::new(RecordingBackend::new(Arc::clone(&events)));
  feed(&backend, "p-map-0", 0, &["a"]).await;

  let processor = MapUdfProcessor::new(
    IsbSvcType::JetStream,
    vertex_instance(1, HashMap::new()),
    backend.clone(),
    Arc::new(EchoFactory {
      ready: false,
      events: Arc::clone(&events),
    }),
  );
  let err = processor.start(CancellationToken::new()).await.unwrap_err();
  assert!(matches!(err, Error::Udf(_)));
  assert!(err.to_string().contains("readiness check"));

  let events = events.lock().unwrap().clone();
  assert!(!events.iter().any(|e| e.starts_with("close reader")), "{:?}", events);
  assert_eq!(
    backend.inner.buffer("p-map-0", 0).await.unread_len().await,
    1
  );
}

#[tokio::test]
async fn test_malformed_stream_annotation_fails_startup() {
  let events: Events = Arc::default();
  let backend = Arc::new(RecordingBackend::new(Arc::clone(&events)));
  let annotations = HashMap::from([(MAP_STREAM_ANNOTATION.to_string(), "maybe".to_string())]);

  let processor = MapUdfProcessor::new(
    IsbSvcType::Redis,
    vertex_instance(1, annotations),
    backend,
    Arc::new(EchoFactory {
      ready: true,
      events: Arc::clone(&events),
    }),
  );
  let err = processor.start(CancellationToken::new()).await.unwrap_err();
  assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn test_streaming_client_failure_fails_startup() {
  let events: Events = Arc::default();
  let backend = Arc::new(RecordingBackend::new(Arc::clone(&events)));
  let annotations = HashMap::from([(MAP_STREAM_ANNOTATION.to_string(), "true".to_string())]);

  let processor = MapUdfProcessor::new(
    IsbSvcType::Redis,
    vertex_instance(1, annotations),
    backend,
    Arc::new(EchoFactory {
      ready: true,
      events: Arc::clone(&events),
    }),
  );
  let err = processor.start(CancellationToken::new()).await.unwrap_err();
  assert!(err.to_string().contains("failed to create map client"));
}
