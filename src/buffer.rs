//! The thread-safe buffer where records wait between the session recorder
//! and the storage writer.

use crate::storage::Record;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A thread-safe FIFO of [`Record`]s. The recorder pushes on one thread, the
/// storage writer drains on another; cloning the buffer clones the handle,
/// not the contents.
#[derive(Debug, Default, Clone)]
pub struct RecordBuffer {
    records: Arc<Mutex<VecDeque<Record>>>,
}

impl RecordBuffer {
    /// Instantiate a new, empty [`RecordBuffer`].
    pub fn new() -> Self {
        RecordBuffer {
            records: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Append a record behind everything already queued. Returns the queue
    /// length afterwards so the caller can decide whether to nudge the
    /// writer.
    pub fn push(&self, record: Record) -> usize {
        let mut records = self.records.lock().unwrap();
        records.push_back(record);
        records.len()
    }

    /// Remove and return up to `max` records from the front, oldest first.
    pub fn drain_batch(&self, max: usize) -> Vec<Record> {
        let mut records = self.records.lock().unwrap();
        let take = max.min(records.len());
        records.drain(..take).collect()
    }

    /// Put a failed batch back at the front, in its original order, so a
    /// retry persists records in exactly the order they arrived.
    pub fn requeue_front(&self, batch: Vec<Record>) {
        let mut records = self.records.lock().unwrap();
        for record in batch.into_iter().rev() {
            records.push_front(record);
        }
    }

    /// How many records are waiting.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Throw away everything queued.
    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(elapsed: f64) -> Record {
        Record {
            timestamp: 1_700_000_000.0 + elapsed,
            elapsed_seconds: elapsed,
            vertical_volts: 1.0,
            horizontal_volts: 2.0,
        }
    }

    #[test]
    fn drains_in_arrival_order() {
        let buffer = RecordBuffer::new();
        for i in 0..5 {
            buffer.push(record(i as f64));
        }

        let batch = buffer.drain_batch(3);
        let elapsed: Vec<f64> = batch.iter().map(|r| r.elapsed_seconds).collect();
        assert_eq!(elapsed, vec![0.0, 1.0, 2.0]);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn drain_caps_at_whats_available() {
        let buffer = RecordBuffer::new();
        buffer.push(record(0.0));
        assert_eq!(buffer.drain_batch(10).len(), 1);
        assert!(buffer.drain_batch(10).is_empty());
    }

    #[test]
    fn requeue_preserves_order_across_a_failed_batch() {
        let buffer = RecordBuffer::new();
        for i in 0..4 {
            buffer.push(record(i as f64));
        }

        let batch = buffer.drain_batch(2);
        buffer.push(record(4.0));
        buffer.requeue_front(batch);

        let all = buffer.drain_batch(10);
        let elapsed: Vec<f64> = all.iter().map(|r| r.elapsed_seconds).collect();
        assert_eq!(elapsed, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn handles_are_shared() {
        let buffer = RecordBuffer::new();
        let other = buffer.clone();
        buffer.push(record(0.0));
        assert_eq!(other.len(), 1);
        other.clear();
        assert!(buffer.is_empty());
    }
}
