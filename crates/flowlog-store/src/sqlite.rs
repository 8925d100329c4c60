//! SQLite-backed [`PersistenceGateway`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use flowlog_error::{FlowlogError, Result};
use flowlog_types::TrafficRecord;
use rusqlite::{Connection, params};
use tracing::{debug, error, info, warn};

use crate::rotation::{archive_path, store_file_size};
use crate::{InsertReport, PersistenceGateway, RotateOutcome};

/// Record table plus the three lookup indexes.
pub const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS traffic_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        protocol TEXT NOT NULL,
        src_ip TEXT NOT NULL,
        src_port INTEGER NOT NULL,
        dst_ip TEXT NOT NULL,
        dst_port INTEGER NOT NULL,
        packets INTEGER NOT NULL,
        bytes INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        cpu_id INTEGER DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_timestamp ON traffic_logs(timestamp);
    CREATE INDEX IF NOT EXISTS idx_src_ip ON traffic_logs(src_ip);
    CREATE INDEX IF NOT EXISTS idx_dst_ip ON traffic_logs(dst_ip);
";

pub const INSERT_SQL: &str = "INSERT INTO traffic_logs \
    (protocol, src_ip, src_port, dst_ip, dst_port, packets, bytes, timestamp, cpu_id) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

const DEFAULT_ROTATION_PREFIX: &str = "logs_";

/// Gateway over one SQLite file whose path never changes; rotation swaps the
/// file underneath it.
pub struct SqliteGateway {
    path: PathBuf,
    rotation_prefix: String,
    /// `None` only after a rotation failed to reopen the active path.
    conn: Option<Connection>,
    rotation_count: u64,
    clock: fn() -> u64,
}

impl std::fmt::Debug for SqliteGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteGateway")
            .field("path", &self.path)
            .field("rotation_prefix", &self.rotation_prefix)
            .field("open", &self.conn.is_some())
            .field("rotation_count", &self.rotation_count)
            .finish_non_exhaustive()
    }
}

impl SqliteGateway {
    /// Open or create the store at `path`.
    ///
    /// # Errors
    /// `FlowlogError::StoreOpen` if SQLite cannot open or read the file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let conn = open_connection(&path)?;
        info!(store = %path.display(), "store opened");
        Ok(Self {
            path,
            rotation_prefix: DEFAULT_ROTATION_PREFIX.to_owned(),
            conn: Some(conn),
            rotation_count: 0,
            clock: unix_now,
        })
    }

    #[must_use]
    pub fn with_rotation_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.rotation_prefix = prefix.into();
        self
    }

    /// Replace the seconds-since-epoch source used for archive names.
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Current handle, reopening the active path if a rotation left none.
    fn connection(&mut self) -> Result<&mut Connection> {
        if self.conn.is_none() {
            warn!(store = %self.path.display(), "store handle missing; reopening");
            let conn = open_connection(&self.path)?;
            apply_schema(&conn)?;
            self.conn = Some(conn);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| FlowlogError::store_open(&self.path, "store handle unavailable"))
    }

    fn rotate(&mut self, size_bytes: u64) -> Result<RotateOutcome> {
        let Some(conn) = self.conn.take() else {
            return Err(FlowlogError::rotate("store handle unavailable"));
        };
        if let Err((conn, err)) = conn.close() {
            self.conn = Some(conn);
            return Err(FlowlogError::rotate(format!("close before rename failed: {err}")));
        }

        let dir = self.path.parent().unwrap_or_else(|| Path::new(""));
        let archive = archive_path(dir, &self.rotation_prefix, (self.clock)());

        if let Err(rename_err) = fs::rename(&self.path, &archive) {
            error!(
                store = %self.path.display(),
                archive = %archive.display(),
                error = %rename_err,
                "store rename failed; keeping current file"
            );
            return match open_connection(&self.path) {
                Ok(conn) => {
                    self.conn = Some(conn);
                    Err(FlowlogError::rotate(format!(
                        "rename to {} failed: {rename_err}",
                        archive.display()
                    )))
                }
                Err(reopen_err) => Err(FlowlogError::rotate(format!(
                    "rename to {} failed: {rename_err}; reopen failed: {reopen_err}",
                    archive.display()
                ))),
            };
        }

        let conn = open_connection(&self.path).map_err(|err| {
            FlowlogError::rotate(format!("store archived but reopen failed: {err}"))
        })?;
        apply_schema(&conn)
            .map_err(|err| FlowlogError::rotate(format!("schema on fresh store failed: {err}")))?;
        self.conn = Some(conn);
        self.rotation_count += 1;

        info!(
            store = %self.path.display(),
            archive = %archive.display(),
            size_bytes,
            rotation_index = self.rotation_count,
            "store rolled over"
        );
        Ok(RotateOutcome::RolledOver {
            archive,
            size_bytes,
            rotation_index: self.rotation_count,
        })
    }
}

impl PersistenceGateway for SqliteGateway {
    fn ensure_schema(&mut self) -> Result<()> {
        let conn = self.connection()?;
        apply_schema(conn)
    }

    fn insert_batch(&mut self, records: &[TrafficRecord]) -> Result<InsertReport> {
        if records.is_empty() {
            return Ok(InsertReport::all(0));
        }

        let conn = self
            .connection()
            .map_err(|err| FlowlogError::insert(err.to_string()))?;
        let tx = conn
            .transaction()
            .map_err(|err| FlowlogError::insert(format!("BEGIN failed: {err}")))?;

        let mut rejected = Vec::new();
        {
            let mut stmt = tx
                .prepare_cached(INSERT_SQL)
                .map_err(|err| FlowlogError::insert(format!("prepare failed: {err}")))?;
            for (index, record) in records.iter().enumerate() {
                let Ok(byte_count) = i64::try_from(record.bytes()) else {
                    warn!(index, bytes = record.bytes(), "byte count exceeds INTEGER range");
                    rejected.push(index);
                    continue;
                };
                let outcome = stmt.execute(params![
                    record.protocol(),
                    record.src_ip(),
                    record.src_port(),
                    record.dst_ip(),
                    record.dst_port(),
                    record.packets(),
                    byte_count,
                    record.timestamp(),
                    record.cpu_id(),
                ]);
                if let Err(err) = outcome {
                    warn!(index, error = %err, "record insert failed");
                    rejected.push(index);
                }
            }
        }

        tx.commit()
            .map_err(|err| FlowlogError::insert(format!("COMMIT failed: {err}")))?;

        let report = InsertReport {
            attempted: records.len(),
            inserted: records.len() - rejected.len(),
            rejected,
        };
        debug!(
            attempted = report.attempted,
            inserted = report.inserted,
            "batch committed"
        );
        Ok(report)
    }

    fn check_and_rotate(&mut self, max_size_bytes: u64) -> Result<RotateOutcome> {
        if self.conn.is_none() {
            self.connection()
                .map_err(|err| FlowlogError::rotate(format!("reopen failed: {err}")))?;
        }
        let size_bytes = store_file_size(&self.path)?;
        if size_bytes < max_size_bytes {
            return Ok(RotateOutcome::NotNeeded { size_bytes });
        }
        self.rotate(size_bytes)
    }

    fn rotation_count(&self) -> u64 {
        self.rotation_count
    }

    fn close(&mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        conn.close().map_err(|(conn, err)| {
            self.conn = Some(conn);
            FlowlogError::Io(std::io::Error::other(format!("store close failed: {err}")))
        })?;
        info!(store = %self.path.display(), "store closed");
        Ok(())
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn =
        Connection::open(path).map_err(|err| FlowlogError::store_open(path, err.to_string()))?;
    // SQLite opens lazily; touch the header so unreadable files fail here.
    conn.pragma_query_value(None, "schema_version", |row| row.get::<_, i64>(0))
        .map_err(|err| FlowlogError::store_open(path, err.to_string()))?;
    Ok(conn)
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)
        .map_err(|err| FlowlogError::schema(err.to_string()))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
