//! # Per-Partition Forwarder
//!
//! [`InterStepDataForward`] moves records from one input partition to the
//! destination buffers of the vertex. It owns its reader and its router; the
//! writers, the watermark fetcher and the publishers are shared with the
//! other partitions' forwarders.
//!
//! One chunk of work:
//!
//! 1. read up to `read_batch_size` records
//! 2. compute the batch watermark
//! 3. apply the handler (ordered, with bounded concurrency; in streaming mode
//!    results are routed and written as they arrive)
//! 4. route every result and write it to its destination partitions
//! 5. publish the batch watermark for every partition written to
//! 6. ack the batch
//!
//! A stop request is honored between chunks. Retries (full buffers, handler
//! errors) give up as soon as a stop is requested, and the aborted chunk is
//! not acked.

use crate::error::{Error, Result};
use crate::isb::{BufferReader, BufferWriter, WriterMap};
use crate::message::{Message, Offset, ReadMessage};
use crate::metrics;
use crate::router::Router;
use crate::topology::{VertexType, is_dropped};
use crate::udf::{MapApplier, MapStreamApplier, UdfHandler};
use crate::watermark::Watermark;
use crate::watermark::fetch::Fetcher;
use crate::watermark::generic::PublisherMap;
use futures::{StreamExt, stream};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default records read per chunk.
pub const DEFAULT_READ_BATCH_SIZE: usize = 500;
/// Default pause between retries.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Forwarder options.
#[derive(Clone, Debug)]
pub struct ForwardOptions {
  /// Records read per chunk.
  pub read_batch_size: usize,
  /// Handler calls in flight per chunk.
  pub udf_concurrency: usize,
  /// Kind of vertex the forwarder runs in.
  pub vertex_type: VertexType,
  /// Use the streaming handler call shape.
  pub udf_streaming: bool,
  /// Pause between retries.
  pub retry_interval: Duration,
}

impl Default for ForwardOptions {
  fn default() -> Self {
    Self {
      read_batch_size: DEFAULT_READ_BATCH_SIZE,
      udf_concurrency: DEFAULT_READ_BATCH_SIZE,
      vertex_type: VertexType::MapUdf,
      udf_streaming: false,
      retry_interval: DEFAULT_RETRY_INTERVAL,
    }
  }
}

impl ForwardOptions {
  /// Sets the read batch size.
  #[must_use]
  pub fn with_read_batch_size(mut self, size: usize) -> Self {
    self.read_batch_size = size;
    self
  }

  /// Sets the handler concurrency.
  #[must_use]
  pub fn with_udf_concurrency(mut self, concurrency: usize) -> Self {
    self.udf_concurrency = concurrency;
    self
  }

  /// Sets the vertex type.
  #[must_use]
  pub fn with_vertex_type(mut self, vertex_type: VertexType) -> Self {
    self.vertex_type = vertex_type;
    self
  }

  /// Selects the streaming handler call shape.
  #[must_use]
  pub fn with_udf_streaming(mut self, streaming: bool) -> Self {
    self.udf_streaming = streaming;
    self
  }

  /// Sets the pause between retries.
  #[must_use]
  pub fn with_retry_interval(mut self, interval: Duration) -> Self {
    self.retry_interval = interval;
    self
  }

  /// Validates the options.
  pub fn validate(&self) -> Result<()> {
    if self.read_batch_size == 0 {
      return Err(Error::Config("read batch size must be at least 1".into()));
    }
    if self.udf_concurrency == 0 {
      return Err(Error::Config("udf concurrency must be at least 1".into()));
    }
    if self.vertex_type != VertexType::MapUdf {
      return Err(Error::Config(format!(
        "forwarder does not support vertex type {:?}",
        self.vertex_type
      )));
    }
    Ok(())
  }
}

/// Requests a cooperative stop of a started forwarder.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
  token: CancellationToken,
}

impl ShutdownHandle {
  /// Asks the forwarder to stop after the current chunk.
  pub fn stop(&self) {
    self.token.cancel();
  }

  /// Returns true once a stop was requested.
  pub fn is_stopped(&self) -> bool {
    self.token.is_cancelled()
  }
}

/// Forwarder for one input partition.
pub struct InterStepDataForward {
  vertex_name: String,
  reader: Arc<dyn BufferReader>,
  writers: Arc<WriterMap>,
  router: Box<dyn Router>,
  handler: UdfHandler,
  fetcher: Arc<dyn Fetcher>,
  publishers: Arc<PublisherMap>,
  options: ForwardOptions,
  stop: CancellationToken,
}

impl InterStepDataForward {
  /// Creates a forwarder.
  ///
  /// # Errors
  ///
  /// `Error::Config` when the options are invalid or the handler's call shape
  /// does not match `options.udf_streaming`.
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    vertex_name: impl Into<String>,
    reader: Arc<dyn BufferReader>,
    writers: Arc<WriterMap>,
    router: Box<dyn Router>,
    handler: UdfHandler,
    fetcher: Arc<dyn Fetcher>,
    publishers: Arc<PublisherMap>,
    options: ForwardOptions,
  ) -> Result<Self> {
    options.validate()?;
    if handler.is_streaming() != options.udf_streaming {
      return Err(Error::Config(format!(
        "handler call shape does not match udf streaming = {}",
        options.udf_streaming
      )));
    }
    Ok(Self {
      vertex_name: vertex_name.into(),
      reader,
      writers,
      router,
      handler,
      fetcher,
      publishers,
      options,
      stop: CancellationToken::new(),
    })
  }

  /// Name of the input partition.
  pub fn partition_name(&self) -> &str {
    self.reader.name()
  }

  /// Spawns the run loop.
  ///
  /// The receiver resolves once the loop has exited and the reader is
  /// closed. It also resolves (with an error) if the loop panics.
  pub fn start(self) -> (ShutdownHandle, oneshot::Receiver<()>) {
    let handle = ShutdownHandle {
      token: self.stop.clone(),
    };
    let (stopped_tx, stopped_rx) = oneshot::channel();
    tokio::spawn(async move {
      self.run().await;
      let _ = stopped_tx.send(());
    });
    (handle, stopped_rx)
  }

  async fn run(mut self) {
    let partition = self.reader.name().to_string();
    info!(
      vertex = %self.vertex_name,
      partition = %partition,
      streaming = self.options.udf_streaming,
      "Starting forwarder"
    );
    while !self.stop.is_cancelled() {
      match self.forward_a_chunk().await {
        Ok(()) => {}
        Err(Error::Cancelled) => break,
        Err(e) => {
          error!(partition = %partition, error = %e, "Failed to forward a chunk");
          if !pause(&self.stop, self.options.retry_interval).await {
            break;
          }
        }
      }
    }
    if let Err(e) = self.reader.close().await {
      warn!(partition = %partition, error = %e, "Failed to close reader");
    }
    info!(partition = %partition, "Forwarder exited");
  }

  async fn forward_a_chunk(&mut self) -> Result<()> {
    let mut batch = self.reader.read(self.options.read_batch_size).await?;
    let Some(last) = batch.last() else {
      return Ok(());
    };
    let partition = self.reader.name().to_string();
    metrics::record_read(&self.vertex_name, &partition, batch.len() as u64);

    let watermark = self.fetcher.compute_watermark(&last.read_offset).await;
    for read in &mut batch {
      read.watermark = watermark;
    }

    let mut written: BTreeMap<(String, u16), i64> = BTreeMap::new();
    match self.handler.clone() {
      UdfHandler::Map(handler) => {
        let outputs = self.apply_batch(handler.as_ref(), &batch).await?;
        let messages: Vec<Message> = outputs.into_iter().flatten().collect();
        self.route_and_write(messages, &mut written).await?;
      }
      UdfHandler::MapStream(handler) => {
        for read in &batch {
          self.stream_one(handler.as_ref(), read, &mut written).await?;
        }
      }
    }

    self.publish_watermark(watermark, &written).await;

    let offsets: Vec<Offset> = batch.iter().map(|r| r.read_offset).collect();
    self.reader.ack(&offsets).await?;
    metrics::record_ack(&self.vertex_name, &partition, offsets.len() as u64);
    debug!(partition = %partition, count = offsets.len(), %watermark, "Forwarded chunk");
    Ok(())
  }

  /// Applies the handler to every record, keeping input order.
  async fn apply_batch(
    &self,
    handler: &dyn MapApplier,
    batch: &[ReadMessage],
  ) -> Result<Vec<Vec<Message>>> {
    let calls: Vec<_> = batch
      .iter()
      .map(|read| self.apply_with_retry(handler, read))
      .collect();
    stream::iter(calls)
      .buffered(self.options.udf_concurrency)
      .collect::<Vec<Result<Vec<Message>>>>()
      .await
      .into_iter()
      .collect()
  }

  async fn apply_with_retry(
    &self,
    handler: &dyn MapApplier,
    read: &ReadMessage,
  ) -> Result<Vec<Message>> {
    loop {
      match handler.apply_map(read).await {
        Ok(messages) => return Ok(messages),
        Err(e) => {
          metrics::record_udf_error(&self.vertex_name, self.reader.name());
          warn!(partition = self.reader.name(), offset = %read.read_offset, error = %e, "Handler call failed, retrying");
          if !pause(&self.stop, self.options.retry_interval).await {
            return Err(Error::Cancelled);
          }
        }
      }
    }
  }

  /// Streams one record through the handler, routing and writing every result
  /// as it arrives.
  async fn stream_one(
    &mut self,
    handler: &dyn MapStreamApplier,
    read: &ReadMessage,
    written: &mut BTreeMap<(String, u16), i64>,
  ) -> Result<()> {
    loop {
      let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
      let produce = handler.apply_map_stream(read, tx);
      let consume = async {
        while let Some(message) = rx.recv().await {
          self.route_and_write(vec![message], written).await?;
        }
        Ok::<(), Error>(())
      };
      let (produced, consumed) = tokio::join!(produce, consume);
      consumed?;
      match produced {
        Ok(()) => return Ok(()),
        Err(e) => {
          metrics::record_udf_error(&self.vertex_name, self.reader.name());
          warn!(partition = self.reader.name(), offset = %read.read_offset, error = %e, "Map stream call failed, retrying");
          if !pause(&self.stop, self.options.retry_interval).await {
            return Err(Error::Cancelled);
          }
        }
      }
    }
  }

  async fn route_and_write(
    &mut self,
    messages: Vec<Message>,
    written: &mut BTreeMap<(String, u16), i64>,
  ) -> Result<()> {
    let (grouped, stats) = group_by_destination(self.router.as_mut(), messages);
    if stats.dropped > 0 {
      metrics::record_drop(&self.vertex_name, self.reader.name(), stats.dropped);
    }
    if stats.unrouted > 0 {
      metrics::record_unrouted(&self.vertex_name, self.reader.name(), stats.unrouted);
    }

    for ((to_vertex, partition_idx), messages) in grouped {
      let writer = self.writer_for(&to_vertex, partition_idx)?;
      let count = messages.len() as u64;
      let offsets = self.write_with_retry(writer.as_ref(), messages).await?;
      metrics::record_write(&self.vertex_name, writer.name(), count);
      if let Some(last) = offsets.last() {
        written.insert((to_vertex, partition_idx), last.sequence);
      }
    }
    Ok(())
  }

  fn writer_for(&self, to_vertex: &str, partition_idx: u16) -> Result<Arc<dyn BufferWriter>> {
    self
      .writers
      .get(to_vertex)
      .and_then(|partitions| partitions.get(partition_idx as usize))
      .cloned()
      .ok_or_else(|| {
        Error::Forwarder(format!(
          "no writer for vertex {} partition {}",
          to_vertex, partition_idx
        ))
      })
  }

  /// Writes every message, resending only what the partition did not take.
  async fn write_with_retry(
    &self,
    writer: &dyn BufferWriter,
    mut messages: Vec<Message>,
  ) -> Result<Vec<Offset>> {
    let mut offsets = Vec::with_capacity(messages.len());
    while !messages.is_empty() {
      match writer.write(messages.clone()).await {
        Ok(written) if !written.is_empty() => {
          messages.drain(..written.len().min(messages.len()));
          offsets.extend(written);
        }
        Ok(_) => {
          if !pause(&self.stop, self.options.retry_interval).await {
            return Err(Error::Cancelled);
          }
        }
        Err(e) => {
          metrics::record_write_error(&self.vertex_name, writer.name());
          if !e.is_retryable() {
            return Err(e);
          }
          debug!(buffer = writer.name(), remaining = messages.len(), error = %e, "Write failed, retrying");
          if !pause(&self.stop, self.options.retry_interval).await {
            return Err(Error::Cancelled);
          }
        }
      }
    }
    Ok(offsets)
  }

  async fn publish_watermark(
    &self,
    watermark: Watermark,
    written: &BTreeMap<(String, u16), i64>,
  ) {
    for ((to_vertex, partition_idx), offset) in written {
      let Some(publisher) = self.publishers.get(to_vertex) else {
        continue;
      };
      if let Err(e) = publisher
        .publish_watermark(watermark, *offset, *partition_idx)
        .await
      {
        warn!(
          to_vertex = %to_vertex,
          partition = partition_idx,
          error = %e,
          "Failed to publish watermark"
        );
      }
    }
  }
}

/// Outputs that were not forwarded anywhere.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct RouteStats {
  /// Tagged with the drop tag.
  pub dropped: u64,
  /// Matched no outgoing edge.
  pub unrouted: u64,
}

/// Routes `messages` and groups the copies by destination partition, keeping
/// the order of `messages` within each group.
pub(crate) fn group_by_destination(
  router: &mut dyn Router,
  messages: Vec<Message>,
) -> (BTreeMap<(String, u16), Vec<Message>>, RouteStats) {
  let mut grouped: BTreeMap<(String, u16), Vec<Message>> = BTreeMap::new();
  let mut stats = RouteStats::default();
  for message in messages {
    let destinations = router.route(&message.keys, &message.tags);
    if destinations.is_empty() {
      if is_dropped(&message.tags) {
        stats.dropped += 1;
      } else {
        stats.unrouted += 1;
      }
      continue;
    }
    for destination in destinations {
      grouped
        .entry((
          destination.to_vertex_name,
          destination.to_vertex_partition_idx,
        ))
        .or_default()
        .push(message.clone());
    }
  }
  (grouped, stats)
}

/// Sleeps for `interval`. Returns false if `stop` fired first.
async fn pause(stop: &CancellationToken, interval: Duration) -> bool {
  tokio::select! {
    _ = stop.cancelled() => false,
    _ = tokio::time::sleep(interval) => true,
  }
}
