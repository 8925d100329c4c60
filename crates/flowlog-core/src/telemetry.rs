//! Collector telemetry: structured events and progress counters.
//!
//! Observers receive every [`CollectorEvent`] the controller emits. They must
//! not block or perform I/O; the flush cycle calls them inline. Counters live
//! in [`CollectorMetrics`] and are read as a [`CollectorStats`] snapshot.
//! Neither events nor counters influence control flow.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// One notable step of the ingest/flush/spill/rotate cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CollectorEvent {
    /// Startup replay moved spilled records back into memory.
    Replayed {
        records: usize,
        /// Records beyond buffer capacity written straight back to the spill file.
        respilled: usize,
        truncated_tail: bool,
        quarantined: bool,
    },
    /// A batch reached the store.
    Flushed { attempted: usize, inserted: usize },
    Spilled { records: usize },
    /// The spill append itself failed; records were re-queued in memory.
    SpillFailed { records: usize, detail: String },
    RolledOver {
        archive: String,
        size_bytes: u64,
        rotation_index: u64,
    },
    RotationFailed { detail: String },
    /// Records lost because neither the store, the spill file nor the buffer
    /// could take them.
    Dropped { records: usize },
}

pub trait CollectorObserver: Send + Sync {
    fn on_event(&self, event: &CollectorEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl CollectorObserver for NoOpObserver {
    #[inline]
    fn on_event(&self, _event: &CollectorEvent) {}
}

/// Keeps the most recent `capacity` events.
pub struct EventRingBuffer {
    events: parking_lot::Mutex<RingInner>,
}

struct RingInner {
    buf: Vec<CollectorEvent>,
    capacity: usize,
    write_pos: usize,
    count: usize,
}

impl EventRingBuffer {
    /// A zero `capacity` is raised to 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: parking_lot::Mutex::new(RingInner {
                buf: Vec::with_capacity(capacity),
                capacity,
                write_pos: 0,
                count: 0,
            }),
        }
    }

    /// Retained events, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<CollectorEvent> {
        let inner = self.events.lock();
        let n = inner.count.min(inner.capacity);
        let start = if inner.count >= inner.capacity {
            inner.write_pos
        } else {
            0
        };
        (0..n)
            .map(|i| inner.buf[(start + i) % inner.capacity].clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.events.lock();
        inner.count.min(inner.capacity)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CollectorObserver for EventRingBuffer {
    fn on_event(&self, event: &CollectorEvent) {
        let mut inner = self.events.lock();
        let pos = inner.write_pos;
        if inner.buf.len() < inner.capacity {
            inner.buf.push(event.clone());
        } else {
            inner.buf[pos] = event.clone();
        }
        inner.write_pos = (pos + 1) % inner.capacity;
        inner.count += 1;
    }
}

/// Live progress counters.
#[derive(Debug, Default)]
pub struct CollectorMetrics {
    ingested: AtomicU64,
    flushed: AtomicU64,
    spilled: AtomicU64,
    replayed: AtomicU64,
    dropped: AtomicU64,
    flush_cycles: AtomicU64,
    rotations: AtomicU64,
    spill_failures: AtomicU64,
}

impl CollectorMetrics {
    pub fn record_ingested(&self, n: usize) {
        self.ingested.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_flushed(&self, n: usize) {
        self.flushed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_spilled(&self, n: usize) {
        self.spilled.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_replayed(&self, n: usize) {
        self.replayed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, n: usize) {
        self.dropped.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_flush_cycle(&self) {
        self.flush_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spill_failure(&self) {
        self.spill_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CollectorStats {
        CollectorStats {
            ingested: self.ingested.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            spilled: self.spilled.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            flush_cycles: self.flush_cycles.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            spill_failures: self.spill_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CollectorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    pub ingested: u64,
    /// Records the store confirmed.
    pub flushed: u64,
    pub spilled: u64,
    pub replayed: u64,
    pub dropped: u64,
    pub flush_cycles: u64,
    pub rotations: u64,
    pub spill_failures: u64,
}
