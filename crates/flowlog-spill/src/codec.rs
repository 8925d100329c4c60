//! Fixed-width spill record encoding.
//!
//! Every record occupies exactly [`SPILL_RECORD_LEN`] bytes, little-endian:
//!
//! ```text
//! offset  width  field
//!      0      1  format version (SPILL_FORMAT_VERSION)
//!      1     16  protocol   (len:u8 + 15 bytes, zero padded)
//!     17     46  src_ip     (len:u8 + 45 bytes, zero padded)
//!     63      2  src_port   u16
//!     65     46  dst_ip     (len:u8 + 45 bytes, zero padded)
//!    111      2  dst_port   u16
//!    113      4  packets    u32
//!    117      8  bytes      u64
//!    125      8  timestamp  i64
//!    133      4  cpu_id     u32
//!    137      8  xxh3_64 of bytes 0..137
//! ```
//!
//! The version byte is per record so the file needs no header. A future
//! version may define a different record length; readers reject versions
//! they do not know.

use flowlog_error::{FlowlogError, Result};
use flowlog_types::{MAX_ADDRESS_LEN, MAX_PROTOCOL_LEN, TrafficRecord, TrafficRecordInit};
use xxhash_rust::xxh3::xxh3_64;

/// Current record format version.
pub const SPILL_FORMAT_VERSION: u8 = 1;

const PROTOCOL_SLOT: usize = 1 + MAX_PROTOCOL_LEN;
const ADDRESS_SLOT: usize = 1 + MAX_ADDRESS_LEN;
const CHECKSUM_BYTES: usize = 8;
const BODY_LEN: usize = 1 + PROTOCOL_SLOT + ADDRESS_SLOT + 2 + ADDRESS_SLOT + 2 + 4 + 8 + 8 + 4;

/// Encoded size of one record, checksum included.
pub const SPILL_RECORD_LEN: usize = BODY_LEN + CHECKSUM_BYTES;

/// Encode one record into its fixed-width form.
#[must_use]
pub fn encode_record(record: &TrafficRecord) -> [u8; SPILL_RECORD_LEN] {
    let mut out = [0u8; SPILL_RECORD_LEN];
    let mut cursor = 0usize;
    out[cursor] = SPILL_FORMAT_VERSION;
    cursor += 1;
    write_text(&mut out, &mut cursor, record.protocol(), MAX_PROTOCOL_LEN);
    write_text(&mut out, &mut cursor, record.src_ip(), MAX_ADDRESS_LEN);
    write_bytes(&mut out, &mut cursor, &record.src_port().to_le_bytes());
    write_text(&mut out, &mut cursor, record.dst_ip(), MAX_ADDRESS_LEN);
    write_bytes(&mut out, &mut cursor, &record.dst_port().to_le_bytes());
    write_bytes(&mut out, &mut cursor, &record.packets().to_le_bytes());
    write_bytes(&mut out, &mut cursor, &record.bytes().to_le_bytes());
    write_bytes(&mut out, &mut cursor, &record.timestamp().to_le_bytes());
    write_bytes(&mut out, &mut cursor, &record.cpu_id().to_le_bytes());
    debug_assert_eq!(cursor, BODY_LEN);
    let checksum = xxh3_64(&out[..BODY_LEN]);
    out[BODY_LEN..].copy_from_slice(&checksum.to_le_bytes());
    out
}

/// Decode one record from exactly [`SPILL_RECORD_LEN`] bytes.
pub fn decode_record(bytes: &[u8]) -> Result<TrafficRecord> {
    if bytes.len() != SPILL_RECORD_LEN {
        return Err(FlowlogError::spill_corrupt(format!(
            "record length {} != {SPILL_RECORD_LEN}",
            bytes.len()
        )));
    }

    let version = bytes[0];
    if version != SPILL_FORMAT_VERSION {
        return Err(FlowlogError::spill_corrupt(format!(
            "unsupported spill record version {version}, expected {SPILL_FORMAT_VERSION}"
        )));
    }

    let mut cursor = BODY_LEN;
    let stored = u64::from_le_bytes(read_array::<8>(bytes, &mut cursor, "checksum")?);
    let computed = xxh3_64(&bytes[..BODY_LEN]);
    if stored != computed {
        return Err(FlowlogError::spill_corrupt(format!(
            "checksum mismatch: stored {stored:#018x}, computed {computed:#018x}"
        )));
    }

    let mut cursor = 1usize;
    let protocol = read_text(bytes, &mut cursor, MAX_PROTOCOL_LEN, "protocol")?;
    let src_ip = read_text(bytes, &mut cursor, MAX_ADDRESS_LEN, "src_ip")?;
    let src_port = u16::from_le_bytes(read_array::<2>(bytes, &mut cursor, "src_port")?);
    let dst_ip = read_text(bytes, &mut cursor, MAX_ADDRESS_LEN, "dst_ip")?;
    let dst_port = u16::from_le_bytes(read_array::<2>(bytes, &mut cursor, "dst_port")?);
    let packets = u32::from_le_bytes(read_array::<4>(bytes, &mut cursor, "packets")?);
    let byte_count = u64::from_le_bytes(read_array::<8>(bytes, &mut cursor, "bytes")?);
    let timestamp = i64::from_le_bytes(read_array::<8>(bytes, &mut cursor, "timestamp")?);
    let cpu_id = u32::from_le_bytes(read_array::<4>(bytes, &mut cursor, "cpu_id")?);

    TrafficRecord::from_init(TrafficRecordInit {
        protocol,
        src_ip,
        src_port,
        dst_ip,
        dst_port,
        packets,
        bytes: byte_count,
        timestamp,
        cpu_id,
    })
    .map_err(|err| FlowlogError::spill_corrupt(format!("decoded record is invalid: {err}")))
}

fn write_bytes(out: &mut [u8], cursor: &mut usize, bytes: &[u8]) {
    out[*cursor..*cursor + bytes.len()].copy_from_slice(bytes);
    *cursor += bytes.len();
}

// Lengths were validated by `TrafficRecord::from_init`, so the cast and the
// slot copy cannot overflow.
fn write_text(out: &mut [u8], cursor: &mut usize, text: &str, max_len: usize) {
    let raw = text.as_bytes();
    debug_assert!(raw.len() <= max_len);
    out[*cursor] = raw.len() as u8;
    out[*cursor + 1..*cursor + 1 + raw.len()].copy_from_slice(raw);
    *cursor += 1 + max_len;
}

fn read_text(bytes: &[u8], cursor: &mut usize, max_len: usize, field: &str) -> Result<String> {
    let [len] = read_array::<1>(bytes, cursor, field)?;
    let len = usize::from(len);
    if len > max_len {
        return Err(FlowlogError::spill_corrupt(format!(
            "field {field} length {len} exceeds slot {max_len}"
        )));
    }
    let start = *cursor;
    *cursor += max_len;
    let slot = bytes.get(start..start + len).ok_or_else(|| {
        FlowlogError::spill_corrupt(format!("field {field} out of bounds at offset {start}"))
    })?;
    String::from_utf8(slot.to_vec())
        .map_err(|err| FlowlogError::spill_corrupt(format!("field {field} is not UTF-8: {err}")))
}

fn read_array<const N: usize>(bytes: &[u8], cursor: &mut usize, field: &str) -> Result<[u8; N]> {
    let end = cursor
        .checked_add(N)
        .ok_or_else(|| FlowlogError::spill_corrupt(format!("overflow reading field {field}")))?;
    if end > bytes.len() {
        return Err(FlowlogError::spill_corrupt(format!(
            "field {field} out of bounds: need {N} bytes at offset {}, total {}",
            *cursor,
            bytes.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[*cursor..end]);
    *cursor = end;
    Ok(out)
}
