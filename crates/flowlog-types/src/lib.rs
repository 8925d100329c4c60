//! Core value types for the flowlog collector.

pub mod cx;
pub mod record;

pub use cx::Cx;
pub use record::{MAX_ADDRESS_LEN, MAX_PROTOCOL_LEN, TrafficRecord, TrafficRecordInit};
