//! Append-only spill file used when the durable store cannot confirm a batch.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use flowlog_error::Result;
use flowlog_types::TrafficRecord;
use tracing::{debug, error, info, warn};

use crate::codec::{SPILL_RECORD_LEN, decode_record, encode_record};

/// Result of reading a spill file without modifying it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpillScan {
    /// Every complete, valid record in file order.
    pub records: Vec<TrafficRecord>,
    /// Trailing bytes shorter than one record (torn append) were ignored.
    pub truncated_tail: bool,
    /// Index of the first record that failed to decode, if any. Scanning
    /// stops there; `records` holds the valid prefix.
    pub corrupt_at: Option<usize>,
}

/// Result of [`SpillStore::replay_and_clear`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpillReplay {
    pub records: Vec<TrafficRecord>,
    pub truncated_tail: bool,
    /// Where a corrupt spill file was moved instead of being deleted.
    pub quarantined: Option<PathBuf>,
}

/// Owner of the spill file path.
#[derive(Debug, Clone)]
pub struct SpillStore {
    path: PathBuf,
}

impl SpillStore {
    /// The file is created lazily on the first non-empty append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Number of complete records currently in the file (0 when absent).
    pub fn record_count(&self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len() / SPILL_RECORD_LEN as u64),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Append `records` in order and sync them to disk.
    ///
    /// A torn record left by an earlier crash or failed write is cut off
    /// first, so new records always start on a record boundary. A failed
    /// write is rolled back to the previous length.
    pub fn append(&self, records: &[TrafficRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut encoded = Vec::with_capacity(records.len() * SPILL_RECORD_LEN);
        for record in records {
            encoded.extend_from_slice(&encode_record(record));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        let on_disk = file.metadata()?.len();
        let aligned = on_disk - on_disk % SPILL_RECORD_LEN as u64;
        if aligned != on_disk {
            warn!(
                spill = %self.path.display(),
                tail_bytes = on_disk - aligned,
                "truncating incomplete trailing spill record before append"
            );
            file.set_len(aligned)?;
        }
        file.seek(SeekFrom::Start(aligned))?;

        if let Err(err) = file.write_all(&encoded).and_then(|()| file.sync_data()) {
            error!(
                spill = %self.path.display(),
                records = records.len(),
                error = %err,
                "spill write failed; rolling back"
            );
            if let Err(rollback) = file.set_len(aligned) {
                error!(error = %rollback, "spill rollback failed");
            }
            return Err(err.into());
        }

        info!(
            spill = %self.path.display(),
            records = records.len(),
            bytes = encoded.len(),
            "records spilled"
        );
        Ok(records.len())
    }

    /// Read every complete record without modifying the file.
    pub fn scan(&self) -> Result<SpillScan> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(SpillScan::default()),
            Err(err) => return Err(err.into()),
        };

        let mut scan = SpillScan::default();
        let mut chunks = bytes.chunks_exact(SPILL_RECORD_LEN);
        for (index, chunk) in chunks.by_ref().enumerate() {
            match decode_record(chunk) {
                Ok(record) => scan.records.push(record),
                Err(err) => {
                    error!(
                        spill = %self.path.display(),
                        record_index = index,
                        error = %err,
                        "corrupt spill record; keeping valid prefix"
                    );
                    scan.corrupt_at = Some(index);
                    return Ok(scan);
                }
            }
        }

        let tail = chunks.remainder().len();
        if tail > 0 {
            warn!(
                spill = %self.path.display(),
                tail_bytes = tail,
                "discarding incomplete trailing spill record"
            );
            scan.truncated_tail = true;
        }
        Ok(scan)
    }

    /// Return every spilled record in file order and clear the file.
    ///
    /// An absent file yields an empty replay. A file with a corrupt record is
    /// renamed to `<path>.corrupt-<unix-ts>` rather than removed.
    pub fn replay_and_clear(&self) -> Result<SpillReplay> {
        if !self.exists() {
            debug!(spill = %self.path.display(), "no spill file to replay");
            return Ok(SpillReplay::default());
        }

        let scan = self.scan()?;
        let quarantined = if scan.corrupt_at.is_some() {
            let target = quarantine_path(&self.path, unix_now());
            fs::rename(&self.path, &target)?;
            warn!(
                spill = %self.path.display(),
                quarantined = %target.display(),
                "corrupt spill file quarantined"
            );
            Some(target)
        } else {
            remove_if_present(&self.path)?;
            None
        };

        info!(
            spill = %self.path.display(),
            records = scan.records.len(),
            truncated_tail = scan.truncated_tail,
            "spill file replayed"
        );
        Ok(SpillReplay {
            records: scan.records,
            truncated_tail: scan.truncated_tail,
            quarantined,
        })
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn quarantine_path(path: &Path, now: u64) -> PathBuf {
    let base = path.to_string_lossy();
    let mut candidate = PathBuf::from(format!("{base}.corrupt-{now}"));
    let mut suffix = 1u32;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{base}.corrupt-{now}-{suffix}"));
        suffix += 1;
    }
    candidate
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
