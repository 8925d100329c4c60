//! In-memory [`PersistenceGateway`] with fault injection.

use std::path::PathBuf;

use flowlog_error::{FlowlogError, Result};
use flowlog_types::TrafficRecord;
use tracing::debug;

use crate::{InsertReport, PersistenceGateway, RotateOutcome};

/// Nominal on-disk cost of one row, used when no size is simulated.
const DEFAULT_ROW_BYTES: u64 = 64;

type RejectFn = Box<dyn Fn(&TrafficRecord) -> bool + Send>;

/// Gateway that keeps rows in a `Vec`.
///
/// Failure knobs:
/// - [`fail_next_batches`](Self::fail_next_batches): the next `n` inserts
///   return `Err` and confirm nothing.
/// - [`set_failing`](Self::set_failing): every insert fails until cleared.
/// - [`reject_where`](Self::reject_where): matching records are rejected
///   individually while the rest of the batch commits.
/// - [`fail_next_rotation`](Self::fail_next_rotation): the next due rotation
///   errors and leaves the rows in place.
pub struct MemoryGateway {
    rows: Vec<TrafficRecord>,
    archives: Vec<Vec<TrafficRecord>>,
    schema_ready: bool,
    closed: bool,
    failing: bool,
    fail_batches: u32,
    fail_rotations: u32,
    reject: Option<RejectFn>,
    simulated_size: Option<u64>,
    rotation_count: u64,
    insert_calls: u64,
}

impl std::fmt::Debug for MemoryGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGateway")
            .field("rows", &self.rows.len())
            .field("archives", &self.archives.len())
            .field("schema_ready", &self.schema_ready)
            .field("failing", &self.failing)
            .field("fail_batches", &self.fail_batches)
            .field("rotation_count", &self.rotation_count)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            archives: Vec::new(),
            schema_ready: false,
            closed: false,
            failing: false,
            fail_batches: 0,
            fail_rotations: 0,
            reject: None,
            simulated_size: None,
            rotation_count: 0,
            insert_calls: 0,
        }
    }

    pub fn fail_next_batches(&mut self, count: u32) {
        self.fail_batches = count;
    }

    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    pub fn reject_where(&mut self, predicate: impl Fn(&TrafficRecord) -> bool + Send + 'static) {
        self.reject = Some(Box::new(predicate));
    }

    pub fn clear_rejections(&mut self) {
        self.reject = None;
    }

    pub fn fail_next_rotation(&mut self) {
        self.fail_rotations += 1;
    }

    /// Override the reported backing size. `None` derives it from row count.
    pub fn set_simulated_size(&mut self, size_bytes: Option<u64>) {
        self.simulated_size = size_bytes;
    }

    /// Rows in the active store, in insertion order.
    pub fn rows(&self) -> &[TrafficRecord] {
        &self.rows
    }

    /// Rows of each rotated-away generation, oldest first.
    pub fn archives(&self) -> &[Vec<TrafficRecord>] {
        &self.archives
    }

    pub const fn insert_calls(&self) -> u64 {
        self.insert_calls
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    fn size_bytes(&self) -> u64 {
        self.simulated_size
            .unwrap_or(self.rows.len() as u64 * DEFAULT_ROW_BYTES)
    }
}

impl PersistenceGateway for MemoryGateway {
    fn ensure_schema(&mut self) -> Result<()> {
        self.schema_ready = true;
        self.closed = false;
        Ok(())
    }

    fn insert_batch(&mut self, records: &[TrafficRecord]) -> Result<InsertReport> {
        self.insert_calls += 1;
        if !self.schema_ready {
            return Err(FlowlogError::insert("no such table: traffic_logs"));
        }
        if self.failing {
            return Err(FlowlogError::insert("store unavailable"));
        }
        if self.fail_batches > 0 {
            self.fail_batches -= 1;
            return Err(FlowlogError::insert("injected batch failure"));
        }

        let mut rejected = Vec::new();
        for (index, record) in records.iter().enumerate() {
            if self.reject.as_ref().is_some_and(|reject| reject(record)) {
                rejected.push(index);
            } else {
                self.rows.push(record.clone());
            }
        }
        debug!(
            attempted = records.len(),
            rejected = rejected.len(),
            "memory batch committed"
        );
        Ok(InsertReport {
            attempted: records.len(),
            inserted: records.len() - rejected.len(),
            rejected,
        })
    }

    fn check_and_rotate(&mut self, max_size_bytes: u64) -> Result<RotateOutcome> {
        let size_bytes = self.size_bytes();
        if size_bytes < max_size_bytes {
            return Ok(RotateOutcome::NotNeeded { size_bytes });
        }
        if self.fail_rotations > 0 {
            self.fail_rotations -= 1;
            return Err(FlowlogError::rotate("injected rename failure"));
        }

        self.archives.push(std::mem::take(&mut self.rows));
        self.simulated_size = None;
        self.rotation_count += 1;
        Ok(RotateOutcome::RolledOver {
            archive: PathBuf::from(format!("memory-archive-{}", self.rotation_count)),
            size_bytes,
            rotation_index: self.rotation_count,
        })
    }

    fn rotation_count(&self) -> u64 {
        self.rotation_count
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlog_types::TrafficRecordInit;

    fn record(packets: u32) -> TrafficRecord {
        TrafficRecord::from_init(TrafficRecordInit {
            protocol: "UDP".to_owned(),
            src_ip: "10.0.0.2".to_owned(),
            src_port: 5353,
            dst_ip: "10.0.0.3".to_owned(),
            dst_port: 53,
            packets,
            bytes: 512,
            timestamp: 1_700_000_000,
            cpu_id: 0,
        })
        .unwrap()
    }

    fn ready() -> MemoryGateway {
        let mut gateway = MemoryGateway::new();
        gateway.ensure_schema().unwrap();
        gateway
    }

    #[test]
    fn insert_requires_schema() {
        let mut gateway = MemoryGateway::new();
        assert!(gateway.insert_batch(&[record(1)]).is_err());
    }

    #[test]
    fn injected_failures_are_consumed() {
        let mut gateway = ready();
        gateway.fail_next_batches(2);
        assert!(gateway.insert_batch(&[record(1)]).is_err());
        assert!(gateway.insert_batch(&[record(2)]).is_err());
        assert!(gateway.insert_batch(&[record(3)]).unwrap().is_complete());
        assert_eq!(gateway.rows().len(), 1);
        assert_eq!(gateway.insert_calls(), 3);
    }

    #[test]
    fn rejected_records_are_reported_by_index() {
        let mut gateway = ready();
        gateway.reject_where(|record| record.packets() % 2 == 0);
        let batch: Vec<_> = (1..=5).map(record).collect();
        let report = gateway.insert_batch(&batch).unwrap();
        assert_eq!(report.rejected, [1, 3]);
        assert_eq!(report.inserted, 3);
        let kept: Vec<_> = gateway.rows().iter().map(TrafficRecord::packets).collect();
        assert_eq!(kept, [1, 3, 5]);
    }

    #[test]
    fn rotation_archives_rows_at_threshold() {
        let mut gateway = ready();
        gateway.insert_batch(&[record(1), record(2)]).unwrap();
        gateway.set_simulated_size(Some(1_000));

        let outcome = gateway.check_and_rotate(1_001).unwrap();
        assert_eq!(outcome, RotateOutcome::NotNeeded { size_bytes: 1_000 });

        let outcome = gateway.check_and_rotate(1_000).unwrap();
        assert!(outcome.rolled_over());
        assert_eq!(gateway.rotation_count(), 1);
        assert!(gateway.rows().is_empty());
        assert_eq!(gateway.archives()[0].len(), 2);
    }

    #[test]
    fn failed_rotation_keeps_rows() {
        let mut gateway = ready();
        gateway.insert_batch(&[record(1)]).unwrap();
        gateway.fail_next_rotation();
        assert!(gateway.check_and_rotate(0).is_err());
        assert_eq!(gateway.rotation_count(), 0);
        assert_eq!(gateway.rows().len(), 1);
        assert!(gateway.check_and_rotate(0).unwrap().rolled_over());
    }
}
