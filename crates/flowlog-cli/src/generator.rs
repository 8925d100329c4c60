//! Synthetic flow records for exercising the collector.

use std::time::{SystemTime, UNIX_EPOCH};

use flowlog_core::RecordSource;
use flowlog_error::Result;
use flowlog_types::{TrafficRecord, TrafficRecordInit};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

const PROTOCOLS: [&str; 3] = ["TCP", "UDP", "ICMP"];
const CPU_COUNT: u32 = 8;

#[derive(Debug)]
pub struct Generator {
    rng: StdRng,
}

impl Generator {
    /// Seeded generators are reproducible; `None` seeds from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self { rng }
    }

    pub fn next_record(&mut self) -> Result<TrafficRecord> {
        let packets = self.rng.gen_range(1..=1000u32);
        let bytes_per_packet = self.rng.gen_range(64..1564u64);
        TrafficRecord::from_init(TrafficRecordInit {
            protocol: PROTOCOLS[self.rng.gen_range(0..PROTOCOLS.len())].to_owned(),
            src_ip: self.address(),
            src_port: self.port(),
            dst_ip: self.address(),
            dst_port: self.port(),
            packets,
            bytes: u64::from(packets) * bytes_per_packet,
            timestamp: unix_now(),
            cpu_id: self.rng.gen_range(0..CPU_COUNT),
        })
    }

    fn address(&mut self) -> String {
        let [a, b, c, d]: [u8; 4] = std::array::from_fn(|_| self.rng.gen_range(0..=255));
        format!("{a}.{b}.{c}.{d}")
    }

    fn port(&mut self) -> u16 {
        self.rng.gen_range(1024..=u16::MAX)
    }
}

impl RecordSource for Generator {
    fn next_batch(&mut self, max: usize) -> Vec<TrafficRecord> {
        let mut batch = Vec::with_capacity(max);
        for _ in 0..max {
            match self.next_record() {
                Ok(record) => batch.push(record),
                Err(err) => warn!(error = %err, "generated record rejected"),
            }
        }
        batch
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs() as i64)
}
