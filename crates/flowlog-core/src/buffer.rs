//! Bounded, ordered holding area for records awaiting persistence.

use flowlog_error::{FlowlogError, Result};
use flowlog_types::TrafficRecord;

/// Returned by [`RecordBuffer::add`] when the buffer is at capacity.
///
/// Carries the rejected record so the caller can retry it after a flush.
#[derive(Debug, thiserror::Error)]
#[error("record buffer full ({capacity} records)")]
pub struct BufferFull {
    record: TrafficRecord,
    capacity: usize,
}

impl BufferFull {
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn into_record(self) -> TrafficRecord {
        self.record
    }
}

/// Fixed-capacity FIFO of [`TrafficRecord`]s.
///
/// `len() <= capacity()` always holds; the only mutations are [`add`],
/// [`requeue`] and [`snapshot_and_clear`].
///
/// [`add`]: Self::add
/// [`requeue`]: Self::requeue
/// [`snapshot_and_clear`]: Self::snapshot_and_clear
#[derive(Debug)]
pub struct RecordBuffer {
    records: Vec<TrafficRecord>,
    capacity: usize,
}

impl RecordBuffer {
    /// # Errors
    /// `FlowlogError::Config` when `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(FlowlogError::config("buffer capacity must be at least 1"));
        }
        Ok(Self {
            records: Vec::with_capacity(capacity),
            capacity,
        })
    }

    /// Append `record`, or hand it back unchanged if the buffer is full.
    pub fn add(&mut self, record: TrafficRecord) -> std::result::Result<(), BufferFull> {
        if self.records.len() >= self.capacity {
            return Err(BufferFull {
                record,
                capacity: self.capacity,
            });
        }
        self.records.push(record);
        Ok(())
    }

    /// Take every held record in insertion order and leave the buffer empty.
    pub fn snapshot_and_clear(&mut self) -> Vec<TrafficRecord> {
        std::mem::replace(&mut self.records, Vec::with_capacity(self.capacity))
    }

    /// Put `records` back ahead of anything currently held, preserving their
    /// order. Returns the tail that did not fit.
    pub fn requeue(&mut self, mut records: Vec<TrafficRecord>) -> Vec<TrafficRecord> {
        let room = self.capacity - self.records.len();
        let overflow = if records.len() > room {
            records.split_off(room)
        } else {
            Vec::new()
        };
        records.append(&mut self.records);
        self.records = records;
        overflow
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_at_or_above_threshold(&self, threshold: usize) -> bool {
        self.records.len() >= threshold
    }

    /// Held records, oldest first.
    pub fn records(&self) -> &[TrafficRecord] {
        &self.records
    }
}
