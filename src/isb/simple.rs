//! In-process bounded buffer partition.
//!
//! `SimpleBuffer` implements both [`BufferReader`] and [`BufferWriter`]. A
//! read hands out messages and keeps them pending until acked; the buffer is
//! full when unread plus unacked messages reach its capacity. A write takes
//! the leading messages that fit and leaves the rest to the caller.

use super::{BufferReader, BufferWriter};
use crate::error::{Error, Result};
use crate::message::{Message, Offset, ReadMessage};
use crate::watermark::Watermark;
use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Default time a read waits for data before returning empty.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct State {
  unread: VecDeque<(i64, Message)>,
  unacked: BTreeSet<i64>,
  next_sequence: i64,
  acked_total: u64,
}

/// Bounded in-memory buffer partition.
#[derive(Debug)]
pub struct SimpleBuffer {
  name: String,
  partition_idx: u16,
  capacity: usize,
  read_timeout: Duration,
  state: Mutex<State>,
  data_ready: Notify,
  closed: AtomicBool,
}

impl SimpleBuffer {
  /// Creates an empty buffer partition.
  pub fn new(name: impl Into<String>, partition_idx: u16, capacity: usize) -> Self {
    Self {
      name: name.into(),
      partition_idx,
      capacity: capacity.max(1),
      read_timeout: DEFAULT_READ_TIMEOUT,
      state: Mutex::new(State::default()),
      data_ready: Notify::new(),
      closed: AtomicBool::new(false),
    }
  }

  /// Sets how long a read waits for data.
  #[must_use]
  pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
    self.read_timeout = timeout;
    self
  }

  /// Returns true once `close` has been called.
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Number of messages written and not yet read.
  pub async fn unread_len(&self) -> usize {
    self.state.lock().await.unread.len()
  }

  /// Number of messages acknowledged so far.
  pub async fn acked_total(&self) -> u64 {
    self.state.lock().await.acked_total
  }

  /// Removes and returns every unread message without acking.
  pub async fn drain(&self) -> Vec<Message> {
    let mut state = self.state.lock().await;
    state.unread.drain(..).map(|(_, m)| m).collect()
  }

  fn ensure_open(&self) -> Result<()> {
    if self.is_closed() {
      return Err(Error::Buffer(format!("buffer {} is closed", self.name)));
    }
    Ok(())
  }

  async fn take(&self, count: usize) -> Vec<ReadMessage> {
    let mut state = self.state.lock().await;
    let n = count.min(state.unread.len());
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
      if let Some((sequence, message)) = state.unread.pop_front() {
        state.unacked.insert(sequence);
        out.push(ReadMessage {
          message,
          read_offset: Offset::new(sequence, self.partition_idx),
          watermark: Watermark::INIT,
        });
      }
    }
    out
  }
}

#[async_trait]
impl BufferReader for SimpleBuffer {
  fn name(&self) -> &str {
    &self.name
  }

  fn partition_idx(&self) -> u16 {
    self.partition_idx
  }

  async fn read(&self, count: usize) -> Result<Vec<ReadMessage>> {
    self.ensure_open()?;
    let batch = self.take(count).await;
    if !batch.is_empty() {
      return Ok(batch);
    }
    let _ = tokio::time::timeout(self.read_timeout, self.data_ready.notified()).await;
    Ok(self.take(count).await)
  }

  async fn ack(&self, offsets: &[Offset]) -> Result<()> {
    let mut state = self.state.lock().await;
    for offset in offsets {
      if state.unacked.remove(&offset.sequence) {
        state.acked_total += 1;
      }
    }
    Ok(())
  }

  async fn pending(&self) -> Result<Option<i64>> {
    let state = self.state.lock().await;
    Ok(Some((state.unread.len() + state.unacked.len()) as i64))
  }

  async fn close(&self) -> Result<()> {
    self.closed.store(true, Ordering::Release);
    self.data_ready.notify_waiters();
    Ok(())
  }
}

#[async_trait]
impl BufferWriter for SimpleBuffer {
  fn name(&self) -> &str {
    &self.name
  }

  fn partition_idx(&self) -> u16 {
    self.partition_idx
  }

  async fn write(&self, messages: Vec<Message>) -> Result<Vec<Offset>> {
    self.ensure_open()?;
    let mut state = self.state.lock().await;
    let room = self
      .capacity
      .saturating_sub(state.unread.len() + state.unacked.len());
    if room == 0 && !messages.is_empty() {
      return Err(Error::BufferFull(self.name.clone()));
    }
    let mut offsets = Vec::with_capacity(messages.len().min(room));
    for message in messages.into_iter().take(room) {
      let sequence = state.next_sequence;
      state.next_sequence += 1;
      state.unread.push_back((sequence, message));
      offsets.push(Offset::new(sequence, self.partition_idx));
    }
    drop(state);
    self.data_ready.notify_one();
    Ok(offsets)
  }

  async fn close(&self) -> Result<()> {
    self.closed.store(true, Ordering::Release);
    self.data_ready.notify_waiters();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn buffer(capacity: usize) -> SimpleBuffer {
    SimpleBuffer::new("p-map-0", 0, capacity).with_read_timeout(Duration::from_millis(10))
  }

  #[tokio::test]
  async fn test_write_read_ack() {
    let b = buffer(10);
    let offsets = BufferWriter::write(&b, vec![Message::new("a"), Message::new("b")])
      .await
      .unwrap();
    assert_eq!(offsets, vec![Offset::new(0, 0), Offset::new(1, 0)]);

    let read = b.read(5).await.unwrap();
    assert_eq!(read.len(), 2);
    assert_eq!(read[1].message.value, "b");
    assert_eq!(b.pending().await.unwrap(), Some(2));

    b.ack(&[read[0].read_offset, read[1].read_offset]).await.unwrap();
    assert_eq!(b.pending().await.unwrap(), Some(0));
    assert_eq!(b.acked_total().await, 2);
  }

  #[tokio::test]
  async fn test_read_empty_times_out() {
    let b = buffer(10);
    assert!(b.read(5).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_full_buffer_rejects_write() {
    let b = buffer(2);
    BufferWriter::write(&b, vec![Message::new("a"), Message::new("b")])
      .await
      .unwrap();
    let err = BufferWriter::write(&b, vec![Message::new("c")]).await.unwrap_err();
    assert!(matches!(err, Error::BufferFull(_)));
    assert!(err.is_retryable());
  }

  #[tokio::test]
  async fn test_write_takes_what_fits() {
    let b = buffer(2);
    let offsets = BufferWriter::write(
      &b,
      vec![Message::new("a"), Message::new("b"), Message::new("c")],
    )
    .await
    .unwrap();
    assert_eq!(offsets, vec![Offset::new(0, 0), Offset::new(1, 0)]);
    assert_eq!(b.unread_len().await, 2);

    let drained = b.drain().await;
    assert_eq!(drained[1].value, "b");
    let offsets = BufferWriter::write(&b, vec![Message::new("c")]).await.unwrap();
    assert_eq!(offsets, vec![Offset::new(2, 0)]);
  }

  #[tokio::test]
  async fn test_empty_write_on_full_buffer_is_ok() {
    let b = buffer(1);
    BufferWriter::write(&b, vec![Message::new("a")]).await.unwrap();
    assert!(BufferWriter::write(&b, vec![]).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_closed_buffer_rejects_io() {
    let b = buffer(2);
    BufferReader::close(&b).await.unwrap();
    assert!(b.read(1).await.is_err());
    assert!(BufferWriter::write(&b, vec![Message::new("a")]).await.is_err());
  }
}
