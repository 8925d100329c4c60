//! Spill file: the last-resort durability path.
//!
//! Records land here when the durable store cannot confirm them. The file is
//! a bare sequence of fixed-width records (see [`codec`]) with no header and
//! no separators. At startup the controller replays it back into memory and
//! clears it.

pub mod codec;
mod store;

pub use codec::{SPILL_FORMAT_VERSION, SPILL_RECORD_LEN, decode_record, encode_record};
pub use store::{SpillReplay, SpillScan, SpillStore};
