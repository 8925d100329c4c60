//! Fixed-shape traffic telemetry record.
//!
//! Text fields are variable-length `String`s whose byte length is validated
//! once at construction; after that a record is immutable. The limits match
//! the fixed-width slots of the spill encoding, so every valid record is
//! encodable.

use std::fmt;

use flowlog_error::{FlowlogError, Result};

/// Maximum byte length of `protocol` (e.g. `TCP`, `UDP`, `ICMP`).
pub const MAX_PROTOCOL_LEN: usize = 15;
/// Maximum byte length of an address; fits the longest IPv6 textual form.
pub const MAX_ADDRESS_LEN: usize = 45;

/// Builder fields for [`TrafficRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRecordInit {
    pub protocol: String,
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    pub packets: u32,
    pub bytes: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub cpu_id: u32,
}

/// One observed flow sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrafficRecord {
    protocol: String,
    src_ip: String,
    src_port: u16,
    dst_ip: String,
    dst_port: u16,
    packets: u32,
    bytes: u64,
    timestamp: i64,
    cpu_id: u32,
}

impl TrafficRecord {
    /// Validate and freeze a record.
    pub fn from_init(init: TrafficRecordInit) -> Result<Self> {
        validate_protocol(&init.protocol)?;
        validate_address("src_ip", &init.src_ip)?;
        validate_address("dst_ip", &init.dst_ip)?;
        Ok(Self {
            protocol: init.protocol,
            src_ip: init.src_ip,
            src_port: init.src_port,
            dst_ip: init.dst_ip,
            dst_port: init.dst_port,
            packets: init.packets,
            bytes: init.bytes,
            timestamp: init.timestamp,
            cpu_id: init.cpu_id,
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn src_ip(&self) -> &str {
        &self.src_ip
    }

    pub const fn src_port(&self) -> u16 {
        self.src_port
    }

    pub fn dst_ip(&self) -> &str {
        &self.dst_ip
    }

    pub const fn dst_port(&self) -> u16 {
        self.dst_port
    }

    pub const fn packets(&self) -> u32 {
        self.packets
    }

    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub const fn cpu_id(&self) -> u32 {
        self.cpu_id
    }
}

impl fmt::Display for TrafficRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{} packets:{} bytes:{} ts:{} cpu:{}",
            self.protocol,
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            self.packets,
            self.bytes,
            self.timestamp,
            self.cpu_id
        )
    }
}

fn validate_protocol(protocol: &str) -> Result<()> {
    if protocol.is_empty() {
        return Err(FlowlogError::invalid_record("protocol", "must be non-empty"));
    }
    if !protocol.is_ascii() {
        return Err(FlowlogError::invalid_record(
            "protocol",
            format!("must be ASCII, got {protocol:?}"),
        ));
    }
    if protocol.len() > MAX_PROTOCOL_LEN {
        return Err(FlowlogError::invalid_record(
            "protocol",
            format!(
                "{} bytes exceeds limit {MAX_PROTOCOL_LEN}",
                protocol.len()
            ),
        ));
    }
    Ok(())
}

fn validate_address(field: &'static str, address: &str) -> Result<()> {
    if address.is_empty() {
        return Err(FlowlogError::invalid_record(field, "must be non-empty"));
    }
    if address.len() > MAX_ADDRESS_LEN {
        return Err(FlowlogError::invalid_record(
            field,
            format!("{} bytes exceeds limit {MAX_ADDRESS_LEN}", address.len()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn init() -> TrafficRecordInit {
        TrafficRecordInit {
            protocol: "TCP".to_owned(),
            src_ip: "192.168.1.10".to_owned(),
            src_port: 51_234,
            dst_ip: "10.0.0.1".to_owned(),
            dst_port: 443,
            packets: 12,
            bytes: 9_000,
            timestamp: 1_700_000_000,
            cpu_id: 3,
        }
    }

    #[test]
    fn accepts_well_formed_record() {
        let record = TrafficRecord::from_init(init()).unwrap();
        assert_eq!(record.protocol(), "TCP");
        assert_eq!(record.src_port(), 51_234);
        assert_eq!(record.bytes(), 9_000);
        assert_eq!(record.cpu_id(), 3);
    }

    #[test]
    fn accepts_longest_ipv6_form() {
        let longest = "ffff:ffff:ffff:ffff:ffff:ffff:255.255.255.255";
        assert_eq!(longest.len(), MAX_ADDRESS_LEN);
        let record = TrafficRecord::from_init(TrafficRecordInit {
            src_ip: longest.to_owned(),
            dst_ip: longest.to_owned(),
            ..init()
        })
        .unwrap();
        assert_eq!(record.src_ip(), longest);
    }

    #[test]
    fn rejects_oversized_address() {
        let err = TrafficRecord::from_init(TrafficRecordInit {
            dst_ip: "a".repeat(MAX_ADDRESS_LEN + 1),
            ..init()
        })
        .unwrap_err();
        assert!(matches!(
            err,
            FlowlogError::InvalidRecord {
                field: "dst_ip",
                ..
            }
        ));
    }

    #[test]
    fn rejects_empty_and_non_ascii_protocol() {
        for bad in ["", "TCPÜ", "SIXTEEN-BYTES-XX"] {
            let err = TrafficRecord::from_init(TrafficRecordInit {
                protocol: bad.to_owned(),
                ..init()
            })
            .unwrap_err();
            assert!(
                matches!(
                    err,
                    FlowlogError::InvalidRecord {
                        field: "protocol",
                        ..
                    }
                ),
                "protocol {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn display_is_single_line() {
        let text = TrafficRecord::from_init(init()).unwrap().to_string();
        assert!(text.starts_with("TCP 192.168.1.10:51234 -> 10.0.0.1:443"));
        assert!(!text.contains('\n'));
    }

    proptest! {
        #[test]
        fn address_length_limit_is_exact(len in 1usize..=64) {
            let result = TrafficRecord::from_init(TrafficRecordInit {
                src_ip: "1".repeat(len),
                ..init()
            });
            prop_assert_eq!(result.is_ok(), len <= MAX_ADDRESS_LEN);
        }
    }
}
