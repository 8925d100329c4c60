//! Buffering and durability core of the flow collector.
//!
//! Records enter a bounded [`RecordBuffer`]. Once the flush threshold is
//! reached the [`Controller`] hands the whole buffer to a
//! [`PersistenceGateway`](flowlog_store::PersistenceGateway); whatever the
//! store cannot confirm goes to the spill file and is replayed on the next
//! start. After a flush that wrote at least one row, the store is rotated if
//! it has grown past the configured size.

pub mod buffer;
pub mod config;
pub mod controller;
pub mod telemetry;

pub use buffer::{BufferFull, RecordBuffer};
pub use config::{CollectorConfig, SpillPolicy};
pub use controller::{
    Controller, ControllerState, FlushReport, RecordSource, ReplayReport,
};
pub use telemetry::{
    CollectorEvent, CollectorMetrics, CollectorObserver, CollectorStats, EventRingBuffer,
    NoOpObserver,
};
