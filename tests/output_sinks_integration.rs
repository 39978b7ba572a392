//! Integration tests for record output
//!
//! Complete runs against the simulated controller, written to the file sinks
//! and read back.

mod common;

use common::builders::ConfigBuilder;
use common::{test_timeout, wait_until};
use readout_rs::buffer::header::decode_legacy_buffer;
use readout_rs::buffer::LegacyBufferType;
use readout_rs::device::{SimulatedDevice, SimulatedDeviceConfig};
use readout_rs::output::{
    read_legacy_stream, JsonLinesSink, LegacyBufferSink, MemoryMonitor, MemorySink,
    StateChangeKind,
};
use readout_rs::{OutputRecord, Readout, ReadoutConfig, TextKind};
use serial_test::serial;
use std::io::BufRead;
use std::time::Duration;
use tempfile::TempDir;

fn simulated(config: &ReadoutConfig) -> Box<SimulatedDevice> {
    Box::new(SimulatedDevice::new(config.simulation.clone()))
}

#[test]
#[serial]
fn test_json_lines_run_reads_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.jsonl");
    let config = ConfigBuilder::new().run(4, "json").build();

    let sink = JsonLinesSink::create(&path).unwrap();
    let mut readout = Readout::new(
        config.clone(),
        simulated(&config),
        Box::new(sink),
        Box::new(MemoryMonitor::new()),
    )
    .unwrap();
    readout.begin().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    readout.end().unwrap();
    let stats = readout.stats();
    readout.shutdown().unwrap();

    let file = std::io::BufReader::new(std::fs::File::open(&path).unwrap());
    let records: Vec<OutputRecord> = file
        .lines()
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
        .collect();

    assert_eq!(records.first().unwrap().state_change(), Some(StateChangeKind::Begin));
    assert_eq!(records.last().unwrap().state_change(), Some(StateChangeKind::End));
    let events = records
        .iter()
        .filter(|r| matches!(r, OutputRecord::PhysicsEvent { .. }))
        .count() as u64;
    assert!(events > 0);
    assert_eq!(events, stats.physics_events);
    assert!(records.iter().all(|r| r.run_number() == 4));
}

#[test]
#[serial]
fn test_simulated_scalers_and_monitor() {
    let mut config = ConfigBuilder::new().build();
    config.simulation = SimulatedDeviceConfig {
        scaler_period: 2,
        monitor_period: 3,
        read_delay_us: 200,
        ..Default::default()
    };
    let sink = MemorySink::new();
    let monitor = MemoryMonitor::new();
    let mut readout = Readout::new(
        config.clone(),
        simulated(&config),
        Box::new(sink.clone()),
        Box::new(monitor.clone()),
    )
    .unwrap();

    readout.begin().unwrap();
    assert!(wait_until(|| readout.stats().buffers_read >= 12, test_timeout()));
    readout.end().unwrap();

    let records = sink.records();
    let scalers: Vec<(u64, u64)> = records
        .iter()
        .filter_map(|r| match r {
            OutputRecord::Scaler {
                interval_start,
                interval_end,
                counters,
                ..
            } => {
                assert_eq!(counters.len(), config.simulation.scaler_channels);
                Some((*interval_start, *interval_end))
            }
            _ => None,
        })
        .collect();
    assert!(!scalers.is_empty());
    assert_eq!(scalers[0].0, 0);
    for pair in scalers.windows(2) {
        assert_eq!(pair[1].0, pair[0].1);
    }
    assert!(!monitor.entries().is_empty());
}

#[test]
#[serial]
fn test_legacy_stream_is_checksummed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.evt");
    let config = ConfigBuilder::new().run(9, "legacy").build();
    let words = config.output.legacy_buffer_words;

    let sink = LegacyBufferSink::create(&path, words).unwrap();
    let mut readout = Readout::new(
        config.clone(),
        simulated(&config),
        Box::new(sink),
        Box::new(MemoryMonitor::new()),
    )
    .unwrap();
    readout
        .submit_text(TextKind::RunVariables, &["title=legacy"])
        .unwrap();
    readout.begin().unwrap();
    std::thread::sleep(Duration::from_millis(30));
    readout.end().unwrap();
    readout.shutdown().unwrap();

    let buffers = read_legacy_stream(std::fs::File::open(&path).unwrap(), words).unwrap();
    let types: Vec<LegacyBufferType> = buffers
        .iter()
        .map(|buffer| {
            let (header, _) = decode_legacy_buffer(buffer).unwrap();
            assert_eq!(header.run_number, 9);
            header.buffer_type
        })
        .collect();

    assert_eq!(types.first(), Some(&LegacyBufferType::RunVariables));
    assert_eq!(types.get(1), Some(&LegacyBufferType::BeginRun));
    assert_eq!(types.last(), Some(&LegacyBufferType::EndRun));
    assert!(types.contains(&LegacyBufferType::Data));
}
