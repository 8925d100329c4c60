//! Collector configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use flowlog_error::{FlowlogError, Result};
use serde::{Deserialize, Serialize};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// What to spill when a batch is only partly confirmed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpillPolicy {
    /// Spill only the records the store did not confirm.
    #[default]
    Unconfirmed,
    /// Spill the whole batch whenever any record is unconfirmed. Confirmed
    /// rows are then present in both the store and the spill file.
    WholeBatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorConfig {
    /// Buffered record count that triggers a flush.
    pub flush_threshold: usize,
    /// Buffer capacity as a multiple of `flush_threshold`.
    pub capacity_multiplier: usize,
    pub store_path: PathBuf,
    pub max_store_size_mb: u64,
    /// Exact rotation limit; takes precedence over `max_store_size_mb`.
    pub max_store_size_bytes: Option<u64>,
    pub rotation_prefix: String,
    pub spill_path: PathBuf,
    pub spill_policy: SpillPolicy,
    /// Records pulled from the source per ingestion step.
    pub ingest_batch_size: usize,
    pub ingest_interval_ms: u64,
    pub log_file: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 10_000,
            capacity_multiplier: 2,
            store_path: PathBuf::from("./logs.db"),
            max_store_size_mb: 100,
            max_store_size_bytes: None,
            rotation_prefix: "logs_".to_owned(),
            spill_path: PathBuf::from("./cache_temp.dat"),
            spill_policy: SpillPolicy::Unconfirmed,
            ingest_batch_size: 10,
            ingest_interval_ms: 100,
            log_file: None,
        }
    }
}

impl CollectorConfig {
    /// Parse a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| FlowlogError::config(err.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            FlowlogError::config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_threshold == 0 {
            return Err(FlowlogError::config("flush_threshold must be at least 1"));
        }
        if self.capacity_multiplier == 0 {
            return Err(FlowlogError::config("capacity_multiplier must be at least 1"));
        }
        if self.flush_threshold.checked_mul(self.capacity_multiplier).is_none() {
            return Err(FlowlogError::config(
                "flush_threshold * capacity_multiplier overflows",
            ));
        }
        if self.ingest_batch_size == 0 {
            return Err(FlowlogError::config("ingest_batch_size must be at least 1"));
        }
        if self.max_store_size_bytes() == 0 {
            return Err(FlowlogError::config("maximum store size must be non-zero"));
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(FlowlogError::config("store_path must be set"));
        }
        if self.spill_path.as_os_str().is_empty() {
            return Err(FlowlogError::config("spill_path must be set"));
        }
        if self.rotation_prefix.is_empty() {
            return Err(FlowlogError::config("rotation_prefix must be non-empty"));
        }
        if self.spill_path == self.store_path {
            return Err(FlowlogError::config(format!(
                "spill_path and store_path are both {}",
                self.store_path.display()
            )));
        }
        Ok(())
    }

    pub fn buffer_capacity(&self) -> usize {
        self.flush_threshold.saturating_mul(self.capacity_multiplier)
    }

    pub fn max_store_size_bytes(&self) -> u64 {
        self.max_store_size_bytes
            .unwrap_or_else(|| self.max_store_size_mb.saturating_mul(BYTES_PER_MB))
    }

    pub fn ingest_interval(&self) -> Duration {
        Duration::from_millis(self.ingest_interval_ms)
    }
}
