//! Flush, spill, replay and rotation scenarios against the in-memory store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flowlog_core::{
    CollectorConfig, CollectorEvent, Controller, ControllerState, EventRingBuffer, SpillPolicy,
};
use flowlog_error::FlowlogError;
use flowlog_spill::SpillStore;
use flowlog_store::{MemoryGateway, PersistenceGateway};
use flowlog_types::{Cx, TrafficRecord, TrafficRecordInit};
use tempfile::tempdir;

fn record(seq: u32) -> TrafficRecord {
    TrafficRecord::from_init(TrafficRecordInit {
        protocol: ["TCP", "UDP", "ICMP"][(seq % 3) as usize].to_owned(),
        src_ip: format!("192.168.1.{}", seq % 254 + 1),
        src_port: 1024 + (seq % 60_000) as u16,
        dst_ip: format!("10.0.0.{}", seq % 254 + 1),
        dst_port: 443,
        packets: seq,
        bytes: u64::from(seq) * 512,
        timestamp: 1_700_000_000 + i64::from(seq),
        cpu_id: seq % 8,
    })
    .unwrap()
}

fn packets(records: &[TrafficRecord]) -> Vec<u32> {
    records.iter().map(TrafficRecord::packets).collect()
}

/// capacity = 2 * threshold; rotation effectively disabled.
fn config(dir: &Path, threshold: usize) -> CollectorConfig {
    CollectorConfig {
        flush_threshold: threshold,
        capacity_multiplier: 2,
        store_path: dir.join("logs.db"),
        spill_path: dir.join("cache_temp.dat"),
        max_store_size_bytes: Some(u64::MAX),
        ..CollectorConfig::default()
    }
}

fn started(config: &CollectorConfig, gateway: MemoryGateway) -> Controller<MemoryGateway> {
    let mut controller = Controller::new(config, gateway).unwrap();
    controller.start().unwrap();
    controller
}

#[test]
fn failed_flush_spills_exactly_the_buffered_records() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 10);
    let mut gateway = MemoryGateway::new();
    gateway.set_failing(true);
    let mut controller = started(&config, gateway);
    assert_eq!(controller.buffer().capacity(), 20);

    for seq in 0..10 {
        controller.ingest(record(seq)).unwrap();
    }

    assert_eq!(controller.gateway().insert_calls(), 1);
    assert!(controller.buffer().is_empty());
    let spilled = SpillStore::new(&config.spill_path).scan().unwrap().records;
    let expected: Vec<_> = (0..10).map(record).collect();
    assert_eq!(spilled, expected);

    let stats = controller.stats();
    assert_eq!(stats.spilled, 10);
    assert_eq!(stats.flushed, 0);
}

#[test]
fn startup_replays_existing_spill_into_buffer() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 10);
    let spill = SpillStore::new(&config.spill_path);
    spill.append(&(0..5).map(record).collect::<Vec<_>>()).unwrap();

    let mut controller = Controller::new(&config, MemoryGateway::new()).unwrap();
    let report = controller.start().unwrap();

    assert_eq!(report.buffered, 5);
    assert_eq!(report.respilled, 0);
    assert_eq!(controller.buffer().len(), 5);
    assert_eq!(packets(controller.buffer().records()), [0, 1, 2, 3, 4]);
    assert!(!spill.exists());
    assert_eq!(controller.stats().replayed, 5);
}

#[test]
fn replay_beyond_capacity_spills_the_excess_back() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 10);
    let spill = SpillStore::new(&config.spill_path);
    spill.append(&(0..25).map(record).collect::<Vec<_>>()).unwrap();

    let mut controller = Controller::new(&config, MemoryGateway::new()).unwrap();
    let report = controller.start().unwrap();

    assert_eq!(report.buffered, 20);
    assert_eq!(report.respilled, 5);
    assert_eq!(controller.buffer().len(), 20);
    assert_eq!(
        packets(&spill.scan().unwrap().records),
        [20, 21, 22, 23, 24]
    );
}

#[test]
fn replayed_records_are_flushed_before_new_ones() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 10);
    SpillStore::new(&config.spill_path)
        .append(&(100..108).map(record).collect::<Vec<_>>())
        .unwrap();

    let mut controller = started(&config, MemoryGateway::new());
    controller.ingest(record(0)).unwrap();
    controller.ingest(record(1)).unwrap();

    assert_eq!(
        packets(controller.gateway().rows()),
        [100, 101, 102, 103, 104, 105, 106, 107, 0, 1]
    );
}

#[test]
fn partial_confirmation_spills_only_unconfirmed_records() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 10);
    let mut gateway = MemoryGateway::new();
    gateway.reject_where(|record| record.packets() % 4 == 0);
    let mut controller = started(&config, gateway);

    for seq in 0..10 {
        controller.ingest(record(seq)).unwrap();
    }

    assert_eq!(controller.gateway().rows().len(), 7);
    let spilled = SpillStore::new(&config.spill_path).scan().unwrap().records;
    assert_eq!(packets(&spilled), [0, 4, 8]);
}

#[test]
fn whole_batch_policy_spills_everything_on_partial_confirmation() {
    let dir = tempdir().unwrap();
    let config = CollectorConfig {
        spill_policy: SpillPolicy::WholeBatch,
        ..config(dir.path(), 10)
    };
    let mut gateway = MemoryGateway::new();
    gateway.reject_where(|record| record.packets() == 3);
    let mut controller = started(&config, gateway);

    for seq in 0..10 {
        controller.ingest(record(seq)).unwrap();
    }

    assert_eq!(controller.gateway().rows().len(), 9);
    let spilled = SpillStore::new(&config.spill_path).scan().unwrap().records;
    assert_eq!(spilled.len(), 10);
}

#[test]
fn spill_failure_requeues_until_buffer_is_full() {
    let dir = tempdir().unwrap();
    let config = CollectorConfig {
        spill_path: dir.path().join("missing-dir").join("cache_temp.dat"),
        ..config(dir.path(), 10)
    };
    let mut gateway = MemoryGateway::new();
    gateway.set_failing(true);
    let ring = Arc::new(EventRingBuffer::new(64));
    let mut controller =
        Controller::new(&config, gateway).unwrap().with_observer(ring.clone());
    controller.start().unwrap();

    for seq in 0..10 {
        controller.ingest(record(seq)).unwrap();
    }
    assert_eq!(controller.buffer().len(), 10);
    assert_eq!(controller.stats().spill_failures, 1);

    for seq in 10..21 {
        controller.ingest(record(seq)).unwrap();
    }
    assert_eq!(controller.buffer().len(), 20);
    assert_eq!(controller.stats().dropped, 1);
    assert!(ring
        .drain()
        .contains(&CollectorEvent::Dropped { records: 1 }));

    // Store recovers: everything still buffered is persisted in order.
    controller.gateway_mut().set_failing(false);
    let report = controller.flush();
    assert_eq!(report.inserted, 20);
    assert_eq!(packets(controller.gateway().rows()), (0..20).collect::<Vec<_>>());
}

#[test]
fn rotation_follows_a_successful_flush() {
    let dir = tempdir().unwrap();
    let config = CollectorConfig {
        max_store_size_bytes: Some(1_000),
        ..config(dir.path(), 5)
    };
    let mut gateway = MemoryGateway::new();
    gateway.set_simulated_size(Some(5_000));
    let ring = Arc::new(EventRingBuffer::new(16));
    let mut controller =
        Controller::new(&config, gateway).unwrap().with_observer(ring.clone());
    controller.start().unwrap();

    for seq in 0..5 {
        controller.ingest(record(seq)).unwrap();
    }

    assert_eq!(controller.gateway().rotation_count(), 1);
    assert_eq!(controller.gateway().archives()[0].len(), 5);
    assert!(controller.gateway().rows().is_empty());
    assert_eq!(controller.stats().rotations, 1);
    assert!(ring.drain().iter().any(|event| matches!(
        event,
        CollectorEvent::RolledOver {
            rotation_index: 1,
            size_bytes: 5_000,
            ..
        }
    )));
}

#[test]
fn rotation_is_not_checked_when_nothing_was_inserted() {
    let dir = tempdir().unwrap();
    let config = CollectorConfig {
        max_store_size_bytes: Some(1),
        ..config(dir.path(), 5)
    };
    let mut gateway = MemoryGateway::new();
    gateway.set_simulated_size(Some(5_000));
    gateway.set_failing(true);
    let mut controller = started(&config, gateway);

    for seq in 0..5 {
        controller.ingest(record(seq)).unwrap();
    }
    assert_eq!(controller.gateway().rotation_count(), 0);
    assert_eq!(controller.stats().spilled, 5);
}

#[test]
fn rotation_failure_is_reported_and_retried_later() {
    let dir = tempdir().unwrap();
    let config = CollectorConfig {
        max_store_size_bytes: Some(1),
        ..config(dir.path(), 2)
    };
    let mut gateway = MemoryGateway::new();
    gateway.fail_next_rotation();
    let ring = Arc::new(EventRingBuffer::new(16));
    let mut controller =
        Controller::new(&config, gateway).unwrap().with_observer(ring.clone());
    controller.start().unwrap();

    controller.ingest(record(0)).unwrap();
    controller.ingest(record(1)).unwrap();
    assert_eq!(controller.gateway().rotation_count(), 0);
    assert_eq!(controller.state(), ControllerState::Running);
    assert!(ring
        .drain()
        .iter()
        .any(|event| matches!(event, CollectorEvent::RotationFailed { .. })));

    controller.ingest(record(2)).unwrap();
    controller.ingest(record(3)).unwrap();
    assert_eq!(controller.gateway().rotation_count(), 1);
    assert_eq!(controller.gateway().archives()[0].len(), 4);
}

#[test]
fn no_records_accepted_after_shutdown() {
    let dir = tempdir().unwrap();
    let mut controller = started(&config(dir.path(), 10), MemoryGateway::new());
    controller.ingest(record(1)).unwrap();
    controller.ingest(record(2)).unwrap();

    let report = controller.shutdown().unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.inserted, 2);
    assert_eq!(controller.state(), ControllerState::Stopped);

    let err = controller.ingest(record(3)).unwrap_err();
    assert!(matches!(err, FlowlogError::NotAccepting { state: "stopped" }));
    assert_eq!(controller.gateway().rows().len(), 2);
}

#[test]
fn records_spilled_at_shutdown_survive_restart() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 10);

    let mut failing = MemoryGateway::new();
    failing.set_failing(true);
    let mut first = started(&config, failing);
    for seq in 0..7 {
        first.ingest(record(seq)).unwrap();
    }
    let report = first.shutdown().unwrap();
    assert_eq!(report.spilled, 7);

    let mut second = started(&config, MemoryGateway::new());
    assert_eq!(second.buffer().len(), 7);
    second.shutdown().unwrap();
    assert_eq!(packets(second.gateway().rows()), (0..7).collect::<Vec<_>>());
    assert!(!SpillStore::new(&config.spill_path).exists());
}

#[test]
fn run_drains_source_until_cancelled() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 10);
    let mut controller = started(&config, MemoryGateway::new());

    let cx = Cx::new();
    let canceller = cx.clone();
    let mut next = 0u32;
    let mut source = |max: usize| {
        let batch: Vec<_> = (next..next + max as u32).map(record).collect();
        next += max as u32;
        if next >= 35 {
            canceller.cancel();
        }
        batch
    };

    let report = controller
        .run(&cx, &mut source, 5, Duration::ZERO)
        .unwrap();

    assert_eq!(controller.state(), ControllerState::Stopped);
    assert_eq!(report.inserted, 5);
    assert_eq!(controller.gateway().rows().len(), 35);
    assert_eq!(controller.stats().ingested, 35);
    assert_eq!(controller.stats().flush_cycles, 4);
}

#[test]
fn run_with_cancelled_context_only_shuts_down() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 10);
    let mut controller = started(&config, MemoryGateway::new());
    for seq in 0..3 {
        controller.ingest(record(seq)).unwrap();
    }

    let cx = Cx::new();
    cx.cancel();
    let mut pulls = 0u32;
    let mut source = |_max: usize| {
        pulls += 1;
        Vec::<TrafficRecord>::new()
    };

    let report = controller
        .run(&cx, &mut source, 5, Duration::from_secs(60))
        .unwrap();

    assert_eq!(pulls, 0);
    assert_eq!(controller.state(), ControllerState::Stopped);
    assert_eq!(report.inserted, 3);
    assert_eq!(packets(controller.gateway().rows()), [0, 1, 2]);
    assert!(controller.gateway().is_closed());
}

#[test]
fn startup_replays_every_pending_spill_record() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 10);
    let spill = SpillStore::new(&config.spill_path);
    let pending: Vec<_> = (0..4).map(record).collect();
    spill.append(&pending).unwrap();
    assert_eq!(spill.record_count().unwrap(), 4);

    let controller = started(&config, MemoryGateway::new());
    assert_eq!(controller.buffer().records(), pending.as_slice());
    assert_eq!(spill.record_count().unwrap(), 0);
}
