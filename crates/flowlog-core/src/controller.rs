//! Ingest → flush-or-spill → rotate orchestration.
//!
//! A [`Controller`] exclusively owns one [`RecordBuffer`], one
//! [`PersistenceGateway`] and one [`SpillStore`]. Every operation takes
//! `&mut self`, so a flush cycle (snapshot, insert, spill, rotation check) is
//! never interleaved with another ingest or flush. Callers sharing a
//! controller between threads wrap it in a mutex and hold it across the
//! whole call.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flowlog_error::{FlowlogError, Result};
use flowlog_spill::SpillStore;
use flowlog_store::{PersistenceGateway, RotateOutcome, SqliteGateway};
use flowlog_types::{Cx, TrafficRecord};
use tracing::{debug, error, info, warn};

use crate::buffer::RecordBuffer;
use crate::config::{CollectorConfig, SpillPolicy};
use crate::telemetry::{
    CollectorEvent, CollectorMetrics, CollectorObserver, CollectorStats, NoOpObserver,
};

/// Lifecycle of a [`Controller`].
///
/// ```text
/// Starting -> Running <-> Flushing
///             Running -> Stopping -> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Starting,
    Running,
    Flushing,
    Stopping,
    Stopped,
}

impl ControllerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Flushing => "flushing",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    pub const fn accepts_records(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Producer of records for [`Controller::run`].
pub trait RecordSource {
    /// Up to `max` new records. An empty batch is fine.
    fn next_batch(&mut self, max: usize) -> Vec<TrafficRecord>;
}

impl<F> RecordSource for F
where
    F: FnMut(usize) -> Vec<TrafficRecord>,
{
    fn next_batch(&mut self, max: usize) -> Vec<TrafficRecord> {
        self(max)
    }
}

/// What one flush cycle did with the buffered records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    /// Confirmed by the store.
    pub inserted: usize,
    /// Appended to the spill file.
    pub spilled: usize,
    /// Put back into the buffer after the spill append failed.
    pub requeued: usize,
    pub dropped: usize,
    pub rotated: bool,
}

/// What startup replay recovered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Records moved into the buffer.
    pub buffered: usize,
    /// Records beyond buffer capacity appended back to the spill file.
    pub respilled: usize,
    pub dropped: usize,
    pub truncated_tail: bool,
    pub quarantined: bool,
}

pub struct Controller<G: PersistenceGateway> {
    flush_threshold: usize,
    max_store_size_bytes: u64,
    spill_policy: SpillPolicy,
    buffer: RecordBuffer,
    gateway: G,
    spill: SpillStore,
    state: ControllerState,
    metrics: Arc<CollectorMetrics>,
    observer: Arc<dyn CollectorObserver>,
}

impl<G: PersistenceGateway + fmt::Debug> fmt::Debug for Controller<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state)
            .field("flush_threshold", &self.flush_threshold)
            .field("buffered", &self.buffer.len())
            .field("gateway", &self.gateway)
            .field("spill", &self.spill)
            .finish_non_exhaustive()
    }
}

impl Controller<SqliteGateway> {
    /// Open the SQLite store named by `config` and run startup.
    ///
    /// # Errors
    /// Fatal store errors (open, schema) and invalid configuration.
    pub fn open(config: &CollectorConfig) -> Result<Self> {
        config.validate()?;
        let gateway = SqliteGateway::open(&config.store_path)?
            .with_rotation_prefix(config.rotation_prefix.clone());
        let mut controller = Self::assemble(config, gateway)?;
        controller.start()?;
        Ok(controller)
    }
}

impl<G: PersistenceGateway> Controller<G> {
    /// Build a controller in the `Starting` state around an open gateway.
    pub fn new(config: &CollectorConfig, gateway: G) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, gateway)
    }

    /// `config` must already be validated.
    fn assemble(config: &CollectorConfig, gateway: G) -> Result<Self> {
        Ok(Self {
            flush_threshold: config.flush_threshold,
            max_store_size_bytes: config.max_store_size_bytes(),
            spill_policy: config.spill_policy,
            buffer: RecordBuffer::with_capacity(config.buffer_capacity())?,
            gateway,
            spill: SpillStore::new(&config.spill_path),
            state: ControllerState::Starting,
            metrics: Arc::new(CollectorMetrics::default()),
            observer: Arc::new(NoOpObserver),
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn CollectorObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Ensure the schema, replay the spill file into the buffer, and start
    /// accepting records.
    ///
    /// # Errors
    /// Schema failure is fatal. Replay I/O failures are logged and leave the
    /// spill file in place for the next start.
    pub fn start(&mut self) -> Result<ReplayReport> {
        if self.state != ControllerState::Starting {
            return Err(FlowlogError::NotAccepting {
                state: self.state.as_str(),
            });
        }
        self.gateway.ensure_schema()?;

        match self.spill.record_count() {
            Ok(0) => {}
            Ok(pending) => info!(
                spill = %self.spill.path().display(),
                pending,
                "spilled records pending replay"
            ),
            Err(err) => warn!(
                spill = %self.spill.path().display(),
                error = %err,
                "cannot size spill file"
            ),
        }
        let report = self.replay();
        self.state = ControllerState::Running;
        info!(
            spill = %self.spill.path().display(),
            buffered = report.buffered,
            capacity = self.buffer.capacity(),
            flush_threshold = self.flush_threshold,
            "collector running"
        );
        Ok(report)
    }

    fn replay(&mut self) -> ReplayReport {
        let replay = match self.spill.replay_and_clear() {
            Ok(replay) => replay,
            Err(err) => {
                error!(
                    spill = %self.spill.path().display(),
                    error = %err,
                    "spill replay failed; leaving file for next start"
                );
                return ReplayReport::default();
            }
        };
        if replay.records.is_empty() && replay.quarantined.is_none() {
            return ReplayReport::default();
        }

        let total = replay.records.len();
        let overflow = self.buffer.requeue(replay.records);
        let mut report = ReplayReport {
            buffered: total - overflow.len(),
            truncated_tail: replay.truncated_tail,
            quarantined: replay.quarantined.is_some(),
            ..ReplayReport::default()
        };
        if !overflow.is_empty() {
            match self.spill.append(&overflow) {
                Ok(n) => report.respilled = n,
                Err(err) => {
                    error!(
                        records = overflow.len(),
                        error = %err,
                        "cannot spill replay overflow back"
                    );
                    report.dropped = overflow.len();
                    self.drop_records(overflow.len());
                }
            }
        }

        self.metrics.record_replayed(report.buffered);
        self.observer.on_event(&CollectorEvent::Replayed {
            records: report.buffered,
            respilled: report.respilled,
            truncated_tail: report.truncated_tail,
            quarantined: report.quarantined,
        });
        info!(
            buffered = report.buffered,
            respilled = report.respilled,
            "spilled records replayed"
        );
        report
    }

    /// Accept one record, flushing once the threshold is reached.
    ///
    /// # Errors
    /// `NotAccepting` unless the controller is running.
    pub fn ingest(&mut self, record: TrafficRecord) -> Result<()> {
        if !self.state.accepts_records() {
            return Err(FlowlogError::NotAccepting {
                state: self.state.as_str(),
            });
        }

        match self.buffer.add(record) {
            Ok(()) => {
                self.metrics.record_ingested(1);
                if self.buffer.is_at_or_above_threshold(self.flush_threshold) {
                    self.flush();
                }
            }
            Err(full) => {
                debug!(capacity = full.capacity(), "buffer full; flushing early");
                self.flush();
                match self.buffer.add(full.into_record()) {
                    Ok(()) => self.metrics.record_ingested(1),
                    Err(_) => {
                        error!("buffer still full after flush; record dropped");
                        self.drop_records(1);
                    }
                }
            }
        }
        Ok(())
    }

    /// Run one flush cycle over everything currently buffered.
    pub fn flush(&mut self) -> FlushReport {
        if self.buffer.is_empty() {
            return FlushReport::default();
        }
        let resume = self.state;
        self.state = ControllerState::Flushing;

        let batch = self.buffer.snapshot_and_clear();
        let mut report = FlushReport {
            attempted: batch.len(),
            ..FlushReport::default()
        };
        self.metrics.record_flush_cycle();

        let unconfirmed = match self.gateway.insert_batch(&batch) {
            Ok(insert) => {
                report.inserted = insert.inserted;
                if insert.is_complete() {
                    Vec::new()
                } else {
                    warn!(
                        attempted = insert.attempted,
                        inserted = insert.inserted,
                        policy = ?self.spill_policy,
                        "store confirmed part of the batch"
                    );
                    match self.spill_policy {
                        SpillPolicy::WholeBatch => batch,
                        SpillPolicy::Unconfirmed => select_rejected(batch, &insert.rejected),
                    }
                }
            }
            Err(err) => {
                error!(records = batch.len(), error = %err, "batch insert failed");
                batch
            }
        };

        self.metrics.record_flushed(report.inserted);
        self.observer.on_event(&CollectorEvent::Flushed {
            attempted: report.attempted,
            inserted: report.inserted,
        });
        if !unconfirmed.is_empty() {
            self.spill_or_requeue(unconfirmed, &mut report);
        }
        if report.inserted > 0 {
            report.rotated = self.check_rotation();
        }

        debug!(
            attempted = report.attempted,
            inserted = report.inserted,
            spilled = report.spilled,
            rotated = report.rotated,
            "flush cycle complete"
        );
        self.state = resume;
        report
    }

    fn spill_or_requeue(&mut self, records: Vec<TrafficRecord>, report: &mut FlushReport) {
        match self.spill.append(&records) {
            Ok(n) => {
                report.spilled = n;
                self.metrics.record_spilled(n);
                self.observer.on_event(&CollectorEvent::Spilled { records: n });
            }
            Err(err) => {
                error!(
                    spill = %self.spill.path().display(),
                    records = records.len(),
                    error = %err,
                    "spill append failed; re-queueing records"
                );
                self.metrics.record_spill_failure();
                self.observer.on_event(&CollectorEvent::SpillFailed {
                    records: records.len(),
                    detail: err.to_string(),
                });
                let total = records.len();
                let overflow = self.buffer.requeue(records);
                report.requeued = total - overflow.len();
                if !overflow.is_empty() {
                    error!(records = overflow.len(), "no room to re-queue; records dropped");
                    report.dropped = overflow.len();
                    self.drop_records(overflow.len());
                }
            }
        }
    }

    fn check_rotation(&mut self) -> bool {
        match self.gateway.check_and_rotate(self.max_store_size_bytes) {
            Ok(RotateOutcome::NotNeeded { .. }) => false,
            Ok(RotateOutcome::RolledOver {
                archive,
                size_bytes,
                rotation_index,
            }) => {
                self.metrics.record_rotation();
                self.observer.on_event(&CollectorEvent::RolledOver {
                    archive: archive.display().to_string(),
                    size_bytes,
                    rotation_index,
                });
                true
            }
            Err(err) => {
                warn!(error = %err, "rotation skipped; will retry after next flush");
                self.observer.on_event(&CollectorEvent::RotationFailed {
                    detail: err.to_string(),
                });
                false
            }
        }
    }

    fn drop_records(&self, n: usize) {
        self.metrics.record_dropped(n);
        self.observer.on_event(&CollectorEvent::Dropped { records: n });
    }

    /// Stop accepting records, flush what remains, and close the store.
    /// Calling it again after it completed is a no-op.
    pub fn shutdown(&mut self) -> Result<FlushReport> {
        match self.state {
            ControllerState::Stopped => return Ok(FlushReport::default()),
            ControllerState::Starting => {
                self.state = ControllerState::Stopped;
                return self.gateway.close().map(|()| FlushReport::default());
            }
            _ => {}
        }

        self.state = ControllerState::Stopping;
        info!(buffered = self.buffer.len(), "collector stopping");
        let mut report = self.flush();

        // Records re-queued by a failed spill cannot outlive the process.
        let stranded = self.buffer.snapshot_and_clear().len();
        if stranded > 0 {
            error!(records = stranded, "records lost at shutdown");
            report.dropped += stranded;
            self.drop_records(stranded);
        }

        let closed = self.gateway.close();
        self.state = ControllerState::Stopped;
        let stats = self.stats();
        info!(
            ingested = stats.ingested,
            flushed = stats.flushed,
            spilled = stats.spilled,
            dropped = stats.dropped,
            rotations = stats.rotations,
            "collector stopped"
        );
        closed.map(|()| report)
    }

    /// Pull from `source` every `interval` until `cx` is cancelled, then shut
    /// down. A flush in progress always completes before cancellation is
    /// observed.
    pub fn run<S: RecordSource + ?Sized>(
        &mut self,
        cx: &Cx,
        source: &mut S,
        batch_size: usize,
        interval: Duration,
    ) -> Result<FlushReport> {
        loop {
            if let Err(reason) = cx.checkpoint() {
                info!(%reason, "stopping ingestion");
                break;
            }
            for record in source.next_batch(batch_size) {
                self.ingest(record)?;
            }
            if !interval.is_zero() {
                thread::sleep(interval);
            }
        }
        self.shutdown()
    }

    pub const fn state(&self) -> ControllerState {
        self.state
    }

    pub fn stats(&self) -> CollectorStats {
        self.metrics.snapshot()
    }

    pub const fn buffer(&self) -> &RecordBuffer {
        &self.buffer
    }

    pub const fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    pub const fn spill(&self) -> &SpillStore {
        &self.spill
    }
}

/// Records at the ascending `rejected` indices of `batch`, in batch order.
fn select_rejected(batch: Vec<TrafficRecord>, rejected: &[usize]) -> Vec<TrafficRecord> {
    let mut wanted = rejected.iter().copied().peekable();
    batch
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| wanted.next_if_eq(&index).map(|_| record))
        .collect()
}
