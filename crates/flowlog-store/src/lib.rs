//! Durable store gateway.
//!
//! [`PersistenceGateway`] is the seam between the flush cycle and the
//! transactional store. [`SqliteGateway`] is the production implementation;
//! [`MemoryGateway`] is a fast stand-in with fault injection for tests.

mod memory;
mod rotation;
mod sqlite;

use std::path::PathBuf;

use flowlog_error::Result;
use flowlog_types::TrafficRecord;

pub use memory::MemoryGateway;
pub use rotation::{archive_path, store_file_size};
pub use sqlite::{INSERT_SQL, SCHEMA_SQL, SqliteGateway};

/// Outcome of one batch insert that reached COMMIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertReport {
    pub attempted: usize,
    /// Records the store confirmed as durably written.
    pub inserted: usize,
    /// Batch indices of records whose insert failed, in ascending order.
    pub rejected: Vec<usize>,
}

impl InsertReport {
    /// Every record confirmed.
    #[must_use]
    pub fn all(attempted: usize) -> Self {
        Self {
            attempted,
            inserted: attempted,
            rejected: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inserted == self.attempted
    }
}

/// Outcome of a size check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotateOutcome {
    NotNeeded {
        size_bytes: u64,
    },
    RolledOver {
        /// Where the previous store file now lives.
        archive: PathBuf,
        size_bytes: u64,
        /// Rotation counter after this rotation.
        rotation_index: u64,
    },
}

impl RotateOutcome {
    #[must_use]
    pub const fn rolled_over(&self) -> bool {
        matches!(self, Self::RolledOver { .. })
    }
}

/// Transactional batch writer owning one durable store.
///
/// Callers must never run `check_and_rotate` while an `insert_batch` is in
/// flight; `&mut self` on both enforces that for a single owner.
pub trait PersistenceGateway {
    /// Create the record table and its indexes if absent. Idempotent.
    fn ensure_schema(&mut self) -> Result<()>;

    /// Insert `records` in order inside a single transaction.
    ///
    /// Record-level failures are reported in [`InsertReport::rejected`] and do
    /// not abort the transaction. `Err` means nothing was confirmed.
    fn insert_batch(&mut self, records: &[TrafficRecord]) -> Result<InsertReport>;

    /// Rotate the store once its backing size reaches `max_size_bytes`.
    fn check_and_rotate(&mut self, max_size_bytes: u64) -> Result<RotateOutcome>;

    /// Number of successful rotations since open.
    fn rotation_count(&self) -> u64;

    /// Release the store handle.
    fn close(&mut self) -> Result<()>;
}
