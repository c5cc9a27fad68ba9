//! Offset timeline of one upstream processor for one partition.

use super::{Watermark, Wmb};
use std::collections::VecDeque;

/// Default number of entries kept per timeline.
pub const DEFAULT_TIMELINE_CAPACITY: usize = 10;

/// Bounded, newest-first list of `(watermark, offset)` pairs.
///
/// Both watermark and offset are non-decreasing from the back to the front.
#[derive(Clone, Debug)]
pub struct OffsetTimeline {
  capacity: usize,
  entries: VecDeque<Wmb>,
}

impl OffsetTimeline {
  /// Creates an empty timeline holding at most `capacity` entries.
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      entries: VecDeque::new(),
    }
  }

  /// Newest entry, if any.
  pub fn head(&self) -> Option<&Wmb> {
    self.entries.front()
  }

  /// Number of entries.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Returns true if nothing has been recorded.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Records `wmb`, ignoring anything that would move the timeline backwards.
  pub fn put(&mut self, wmb: Wmb) {
    match self.entries.front().copied() {
      None => self.entries.push_front(wmb),
      Some(head) if wmb.watermark == head.watermark => {
        if wmb.offset > head.offset {
          if let Some(front) = self.entries.front_mut() {
            front.offset = wmb.offset;
            front.idle = wmb.idle;
          }
        }
      }
      Some(head) if wmb.watermark > head.watermark && wmb.offset >= head.offset => {
        self.entries.push_front(wmb);
      }
      Some(_) => return,
    }
    while self.entries.len() > self.capacity {
      self.entries.pop_back();
    }
  }

  /// Watermark in effect for a record read at `offset`: the watermark of the
  /// newest entry written strictly before it.
  pub fn get_event_time(&self, offset: i64) -> Watermark {
    self
      .entries
      .iter()
      .find(|entry| entry.offset < offset)
      .map(|entry| Watermark(entry.watermark))
      .unwrap_or(Watermark::INIT)
  }
}

impl Default for OffsetTimeline {
  fn default() -> Self {
    Self::new(DEFAULT_TIMELINE_CAPACITY)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn wmb(offset: i64, watermark: i64) -> Wmb {
    Wmb {
      idle: false,
      offset,
      watermark,
      partition: 0,
    }
  }

  #[test]
  fn test_event_time_uses_newest_earlier_entry() {
    let mut t = OffsetTimeline::default();
    t.put(wmb(10, 100));
    t.put(wmb(20, 200));
    t.put(wmb(30, 300));
    assert_eq!(t.get_event_time(5), Watermark::INIT);
    assert_eq!(t.get_event_time(11), Watermark(100));
    assert_eq!(t.get_event_time(25), Watermark(200));
    assert_eq!(t.get_event_time(31), Watermark(300));
  }

  #[test]
  fn test_older_watermark_is_ignored() {
    let mut t = OffsetTimeline::default();
    t.put(wmb(10, 100));
    t.put(wmb(20, 50));
    assert_eq!(t.len(), 1);
    assert_eq!(t.head().map(|h| h.watermark), Some(100));
  }

  #[test]
  fn test_same_watermark_advances_offset() {
    let mut t = OffsetTimeline::default();
    t.put(wmb(10, 100));
    t.put(wmb(15, 100));
    assert_eq!(t.len(), 1);
    assert_eq!(t.head().map(|h| h.offset), Some(15));
  }

  #[test]
  fn test_capacity_is_bounded() {
    let mut t = OffsetTimeline::new(3);
    for i in 1..=5 {
      t.put(wmb(i * 10, i * 100));
    }
    assert_eq!(t.len(), 3);
    assert_eq!(t.get_event_time(25), Watermark::INIT);
  }
}
