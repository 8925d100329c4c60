//! Error taxonomy shared by every flowlog crate.
//!
//! The collector distinguishes three classes of failure:
//! - **fatal**: the durable store cannot be opened or its schema cannot be
//!   created. These halt startup.
//! - **recoverable**: batch insert, spill, rotation and record-level failures.
//!   The controller degrades (spill, skip rotation) and keeps running.
//! - **lifecycle**: cancellation and calls made after shutdown began.

use std::path::PathBuf;

/// Result alias used across the workspace.
pub type Result<T, E = FlowlogError> = std::result::Result<T, E>;

/// Primary error type for the collector.
#[derive(Debug, thiserror::Error)]
pub enum FlowlogError {
    /// Filesystem failure (spill file, store file metadata, rename).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The durable store could not be opened.
    #[error("cannot open store at {path}: {detail}")]
    StoreOpen { path: PathBuf, detail: String },

    /// The record table or one of its indexes could not be created.
    #[error("schema error: {detail}")]
    Schema { detail: String },

    /// A batch could not be written to the store.
    #[error("insert failed: {detail}")]
    Insert { detail: String },

    /// Size-triggered rotation of the store file failed.
    #[error("rotation failed: {detail}")]
    Rotate { detail: String },

    /// The spill file contains bytes that are not a valid record.
    #[error("spill file corrupt: {detail}")]
    SpillCorrupt { detail: String },

    /// A record field violates its length or range limit.
    #[error("invalid record field `{field}`: {detail}")]
    InvalidRecord { field: &'static str, detail: String },

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {detail}")]
    Config { detail: String },

    /// The controller no longer accepts records.
    #[error("controller is not accepting records (state: {state})")]
    NotAccepting { state: &'static str },

    /// Cooperative cancellation was observed.
    #[error("operation cancelled")]
    Cancelled,
}

impl FlowlogError {
    pub fn store_open(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::StoreOpen {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn schema(detail: impl Into<String>) -> Self {
        Self::Schema {
            detail: detail.into(),
        }
    }

    pub fn insert(detail: impl Into<String>) -> Self {
        Self::Insert {
            detail: detail.into(),
        }
    }

    pub fn rotate(detail: impl Into<String>) -> Self {
        Self::Rotate {
            detail: detail.into(),
        }
    }

    pub fn spill_corrupt(detail: impl Into<String>) -> Self {
        Self::SpillCorrupt {
            detail: detail.into(),
        }
    }

    pub fn invalid_record(field: &'static str, detail: impl Into<String>) -> Self {
        Self::InvalidRecord {
            field,
            detail: detail.into(),
        }
    }

    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config {
            detail: detail.into(),
        }
    }

    /// Whether this error must terminate startup.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreOpen { .. } | Self::Schema { .. })
    }
}
