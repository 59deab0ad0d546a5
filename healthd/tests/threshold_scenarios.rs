//! End-to-end threshold scenarios driven through real collections with
//! temp-file-backed proc sources and the in-process property bus.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use bmc_healthd::bus::InMemoryBus;
use bmc_healthd::collection::HealthMetricCollection;
use bmc_healthd::events::{EventRecord, LocalEventLog};
use bmc_healthd::metric_config::{
    Bound, MetricConfig, MetricType, SubType, ThresholdConfig, ThresholdKey, ThresholdType,
};
use bmc_healthd::platform::LoggingStarter;
use bmc_healthd::sampler::{CpuSampler, MemorySampler, StorageSampler, TypeSampler};

struct Deps {
    bus: Arc<InMemoryBus>,
    events: Arc<LocalEventLog>,
    units: Arc<LoggingStarter>,
}

fn deps() -> Deps {
    Deps {
        bus: Arc::new(InMemoryBus::new()),
        events: Arc::new(LocalEventLog::new()),
        units: Arc::new(LoggingStarter::new()),
    }
}

fn threshold(value: f64, log: bool) -> ThresholdConfig {
    ThresholdConfig {
        value,
        log,
        target: String::new(),
        sel: false,
    }
}

fn key(severity: ThresholdType, bound: Bound) -> ThresholdKey {
    ThresholdKey::new(severity, bound)
}

#[test]
fn cpu_threshold_crossing_asserts_and_deasserts() {
    let dir = TempDir::new().unwrap();
    let stat = dir.path().join("stat");
    fs::write(&stat, "cpu 100 0 0 900 0 0 0 0 0 0\n").unwrap();

    let mut thresholds = BTreeMap::new();
    thresholds.insert(key(ThresholdType::Critical, Bound::Upper), threshold(90.0, true));
    thresholds.insert(key(ThresholdType::Warning, Bound::Upper), threshold(80.0, false));

    let config = MetricConfig {
        name: "CPU".to_string(),
        subtype: SubType::CpuTotal,
        window_size: 1,
        hysteresis: 0.0,
        path: PathBuf::new(),
        thresholds,
    };

    let d = deps();
    let mut collection = HealthMetricCollection::with_sampler(
        MetricType::Cpu,
        TypeSampler::Cpu(CpuSampler::with_source(&stat)),
        vec![config],
        &["/xyz/openbmc_project/inventory/bmc".to_string()],
        d.bus.clone(),
        d.events.clone(),
        d.units.clone(),
    )
    .unwrap();

    // Baseline tick: 10 % since boot, below both thresholds.
    collection.read();
    assert!(d.bus.signals().is_empty());

    // 950 of 1000 new jiffies active: 95 %, both uppers assert, one log.
    fs::write(&stat, "cpu 1050 0 0 950 0 0 0 0 0 0\n").unwrap();
    collection.read();
    let signals = d.bus.signals();
    assert_eq!(signals.len(), 2);
    assert!(signals.iter().all(|(_, s)| s.asserted));
    assert!((signals[0].1.value - 95.0).abs() < 1e-9);
    assert_eq!(d.events.open_entry_count(), 1);

    // 850 of 1000 active: 85 %, critical clears, warning holds the log.
    fs::write(&stat, "cpu 1900 0 0 1100 0 0 0 0 0 0\n").unwrap();
    collection.read();
    let signals = d.bus.signals();
    assert_eq!(signals.len(), 3);
    let (_, last) = signals.last().unwrap();
    assert!(!last.asserted);
    assert_eq!(last.severity, ThresholdType::Critical);
    assert_eq!(d.events.open_entry_count(), 1);

    // 750 of 1000 active: 75 %, warning clears and the entry resolves.
    fs::write(&stat, "cpu 2650 0 0 1350 0 0 0 0 0 0\n").unwrap();
    collection.read();
    assert_eq!(d.bus.signals().len(), 4);
    assert_eq!(d.events.open_entry_count(), 0);
    let records = d.events.records();
    assert!(matches!(records.last(), Some(EventRecord::Normal { .. })));
}

#[test]
fn memory_used_polarity_asserts_only_past_used_percentage() {
    let dir = TempDir::new().unwrap();
    let meminfo = dir.path().join("meminfo");
    // ~90 % available means ~10 % used: far below a 90 % used threshold.
    fs::write(&meminfo, "MemTotal: 1500 kB\nMemAvailable: 1351 kB\n").unwrap();

    let mut thresholds = BTreeMap::new();
    thresholds.insert(key(ThresholdType::Critical, Bound::Upper), threshold(90.0, true));

    let config = MetricConfig {
        name: "Memory".to_string(),
        subtype: SubType::MemoryTotal,
        window_size: 1,
        hysteresis: 0.0,
        path: PathBuf::new(),
        thresholds,
    };

    let d = deps();
    let mut collection = HealthMetricCollection::with_sampler(
        MetricType::Memory,
        TypeSampler::Memory(MemorySampler::with_source(&meminfo)),
        vec![config],
        &[],
        d.bus.clone(),
        d.events.clone(),
        d.units.clone(),
    )
    .unwrap();

    collection.read();
    assert!(d.bus.signals().is_empty());

    // Available collapses to 100 kB: ~93 % used, the threshold asserts.
    fs::write(&meminfo, "MemTotal: 1500 kB\nMemAvailable: 100 kB\n").unwrap();
    collection.read();
    let signals = d.bus.signals();
    assert_eq!(signals.len(), 1);
    assert!(signals[0].1.asserted);
    assert_eq!(signals[0].1.severity, ThresholdType::Critical);
    assert_eq!(d.events.open_entry_count(), 1);
}

#[test]
fn memory_available_lower_bound_asserts_when_scarce() {
    let dir = TempDir::new().unwrap();
    let meminfo = dir.path().join("meminfo");
    fs::write(&meminfo, "MemTotal: 1000 kB\nMemAvailable: 500 kB\n").unwrap();

    let mut thresholds = BTreeMap::new();
    thresholds.insert(key(ThresholdType::Critical, Bound::Lower), threshold(15.0, true));

    let config = MetricConfig {
        name: "Memory_Available".to_string(),
        subtype: SubType::MemoryAvailable,
        window_size: 1,
        hysteresis: 0.0,
        path: PathBuf::new(),
        thresholds,
    };

    let d = deps();
    let mut collection = HealthMetricCollection::with_sampler(
        MetricType::Memory,
        TypeSampler::Memory(MemorySampler::with_source(&meminfo)),
        vec![config],
        &[],
        d.bus.clone(),
        d.events.clone(),
        d.units.clone(),
    )
    .unwrap();

    collection.read();
    assert!(d.bus.signals().is_empty());

    // 10 % available is below the 15 % lower bound.
    fs::write(&meminfo, "MemTotal: 1000 kB\nMemAvailable: 100 kB\n").unwrap();
    collection.read();
    let signals = d.bus.signals();
    assert_eq!(signals.len(), 1);
    assert!(signals[0].1.asserted);
    assert_eq!(signals[0].1.bound, Bound::Lower);
}

#[test]
fn storage_stat_failure_keeps_last_value_and_state() {
    let base = TempDir::new().unwrap();
    let mount = base.path().join("mount");
    fs::create_dir(&mount).unwrap();

    let config = MetricConfig {
        name: "Storage_RW".to_string(),
        subtype: SubType::Na,
        window_size: 1,
        hysteresis: 0.0,
        path: mount.clone(),
        thresholds: BTreeMap::new(),
    };

    let d = deps();
    let mut collection = HealthMetricCollection::with_sampler(
        MetricType::Storage,
        TypeSampler::Storage(StorageSampler),
        vec![config],
        &[],
        d.bus.clone(),
        d.events.clone(),
        d.units.clone(),
    )
    .unwrap();

    collection.read();
    let path = "/xyz/openbmc_project/metric/bmc/storage/rw";
    let published = d.bus.object(path).unwrap().value;
    assert!(!published.is_nan());

    fs::remove_dir(&mount).unwrap();
    let outcome = collection.read();
    assert_eq!(outcome.updated, 0);
    assert!(!outcome.sampler_failed);
    assert_eq!(d.bus.object(path).unwrap().value, published);
    assert!(d.bus.signals().is_empty());
}

#[test]
fn window_cold_start_suppresses_alarms_across_ticks() {
    let dir = TempDir::new().unwrap();
    let meminfo = dir.path().join("meminfo");
    fs::write(&meminfo, "MemTotal: 1000 kB\nMemAvailable: 10 kB\n").unwrap();

    let mut thresholds = BTreeMap::new();
    thresholds.insert(key(ThresholdType::Critical, Bound::Lower), threshold(15.0, true));

    let config = MetricConfig {
        name: "Memory_Available".to_string(),
        subtype: SubType::MemoryAvailable,
        window_size: 3,
        hysteresis: 0.0,
        path: PathBuf::new(),
        thresholds,
    };

    let d = deps();
    let mut collection = HealthMetricCollection::with_sampler(
        MetricType::Memory,
        TypeSampler::Memory(MemorySampler::with_source(&meminfo)),
        vec![config],
        &[],
        d.bus.clone(),
        d.events.clone(),
        d.units.clone(),
    )
    .unwrap();

    // Two ticks on a three-sample window: no evaluation yet, even though
    // every reading violates the bound.
    collection.read();
    collection.read();
    assert!(d.bus.signals().is_empty());
    assert_eq!(d.events.open_entry_count(), 0);

    // The third tick fills the window and asserts.
    collection.read();
    assert_eq!(d.bus.signals().len(), 1);
    assert_eq!(d.events.open_entry_count(), 1);
}
