//! Store file sizing and archive naming.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use flowlog_error::Result;

/// Extension given to archived store files.
const ARCHIVE_EXTENSION: &str = "db";

/// Size in bytes of the store file at `path`; an absent file has size 0.
pub fn store_file_size(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

/// First free archive name `<prefix><timestamp>.db` in `dir`.
///
/// Two rotations within the same second would collide, so taken names get a
/// `-1`, `-2`, ... suffix.
#[must_use]
pub fn archive_path(dir: &Path, prefix: &str, timestamp: u64) -> PathBuf {
    let candidate = dir.join(format!("{prefix}{timestamp}.{ARCHIVE_EXTENSION}"));
    if !candidate.exists() {
        return candidate;
    }
    let mut suffix = 1u32;
    loop {
        let candidate = dir.join(format!("{prefix}{timestamp}-{suffix}.{ARCHIVE_EXTENSION}"));
        if !candidate.exists() {
            return candidate;
        }
        suffix += 1;
    }
}
