//! Raw sample collection from OS counters
//!
//! One sampler exists per metric type. A sampler reads its OS source once
//! per tick and produces a `(current, total)` pair for every configured
//! metric of that type, keyed by the metric's configuration name. The CPU
//! sampler is the only stateful one: it retains previous jiffy counts per
//! subtype to compute per-tick deltas.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{SamplerError, SamplerResult};
use crate::metric_config::{MetricConfig, MetricType, SubType};

/// One raw reading: the current value and the normalizing capacity.
///
/// `total` is 100 for percentage-native metrics (CPU), the byte capacity
/// for memory and storage metrics, and the inode count for inode metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub current: f64,
    pub total: f64,
}

/// Samples for one tick, keyed by metric configuration name.
pub type SampleSet = HashMap<String, Sample>;

/// Kernel CPU accounting source.
const PROC_STAT: &str = "/proc/stat";
/// Kernel memory accounting source.
const PROC_MEMINFO: &str = "/proc/meminfo";

/// The kernel reports meminfo values in kB meaning KiB; convert to bytes
/// with 1024 consistently across all memory subtypes.
const MEMINFO_BYTES_PER_KB: f64 = 1024.0;

/// Fields of the aggregate `cpu` line, in kernel order.
const CPU_STATS_FIELDS: usize = 10;

const USER: usize = 0;
const NICE: usize = 1;
const SYSTEM: usize = 2;
const IDLE: usize = 3;
const IOWAIT: usize = 4;
const IRQ: usize = 5;
const SOFTIRQ: usize = 6;
const STEAL: usize = 7;
const GUEST_USER: usize = 8;
const GUEST_NICE: usize = 9;

/// Previous jiffy counters for one CPU subtype.
#[derive(Debug, Clone, Copy, Default)]
struct CpuCounters {
    active: u64,
    total: u64,
}

/// CPU utilization sampler over the kernel's aggregate time-accounting line.
#[derive(Debug)]
pub struct CpuSampler {
    stat_path: PathBuf,
    previous: HashMap<SubType, CpuCounters>,
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::with_source(PROC_STAT)
    }
}

impl CpuSampler {
    pub fn with_source(path: impl Into<PathBuf>) -> Self {
        Self {
            stat_path: path.into(),
            previous: HashMap::new(),
        }
    }

    pub fn sample(&mut self, configs: &[Arc<MetricConfig>]) -> SamplerResult<SampleSet> {
        let times = read_cpu_times(&self.stat_path)?;
        let total: u64 = times.iter().sum();

        let mut samples = SampleSet::new();
        for config in configs {
            // Jiffies; on a BMC one jiffy is typically 0.01 s.
            let active: u64 = match config.subtype {
                SubType::CpuTotal => {
                    times[USER]
                        + times[NICE]
                        + times[SYSTEM]
                        + times[IRQ]
                        + times[SOFTIRQ]
                        + times[STEAL]
                        + times[GUEST_USER]
                        + times[GUEST_NICE]
                }
                SubType::CpuKernel => times[SYSTEM],
                SubType::CpuUser => times[USER],
                other => {
                    warn!(metric = %config.name, subtype = ?other, "not a CPU subtype, skipping");
                    continue;
                }
            };

            let previous = self.previous.entry(config.subtype).or_default();
            let active_delta = active.saturating_sub(previous.active);
            let total_delta = total.saturating_sub(previous.total);

            // Store for the next tick's delta, exactly once per subtype.
            previous.active = active;
            previous.total = total;

            let percent = if total_delta > 0 {
                100.0 * active_delta as f64 / total_delta as f64
            } else {
                f64::NAN
            };
            let idle = times[IDLE] + times[IOWAIT];
            debug!(metric = %config.name, value = percent, idle, "cpu sample");

            samples.insert(
                config.name.clone(),
                Sample {
                    current: percent,
                    total: 100.0,
                },
            );
        }

        Ok(samples)
    }
}

/// Parse the aggregate `cpu` line. Fails without touching sampler state if
/// the label is missing or fewer than the expected fields are present.
fn read_cpu_times(path: &Path) -> SamplerResult<[u64; CPU_STATS_FIELDS]> {
    let text = fs::read_to_string(path).map_err(|e| SamplerError::SourceUnreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let first_line = text.lines().next().unwrap_or("");
    let mut fields = first_line.split_whitespace();

    if fields.next() != Some("cpu") {
        return Err(SamplerError::MissingCpuLabel {
            path: path.display().to_string(),
        });
    }

    let mut times = [0u64; CPU_STATS_FIELDS];
    let mut count = 0;
    for slot in times.iter_mut() {
        match fields.next().and_then(|f| f.parse::<u64>().ok()) {
            Some(value) => {
                *slot = value;
                count += 1;
            }
            None => break,
        }
    }

    if count != CPU_STATS_FIELDS {
        return Err(SamplerError::TruncatedCpuLine {
            path: path.display().to_string(),
            count,
            expected: CPU_STATS_FIELDS,
        });
    }

    Ok(times)
}

/// Memory sampler over the kernel's keyed memory-info source.
#[derive(Debug)]
pub struct MemorySampler {
    meminfo_path: PathBuf,
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self::with_source(PROC_MEMINFO)
    }
}

impl MemorySampler {
    pub fn with_source(path: impl Into<PathBuf>) -> Self {
        Self {
            meminfo_path: path.into(),
        }
    }

    pub fn sample(&mut self, configs: &[Arc<MetricConfig>]) -> SamplerResult<SampleSet> {
        let values = read_meminfo(&self.meminfo_path)?;

        let total_kb = *values
            .get("MemTotal")
            .ok_or(SamplerError::MissingMemoryKey {
                path: self.meminfo_path.display().to_string(),
                key: "MemTotal",
            })?;
        let total = total_kb as f64 * MEMINFO_BYTES_PER_KB;

        let mut samples = SampleSet::new();
        for config in configs {
            let current_kb = match config.subtype {
                SubType::MemoryAvailable => values.get("MemAvailable").copied(),
                SubType::MemoryFree => values.get("MemFree").copied(),
                SubType::MemoryShared => values.get("Shmem").copied(),
                SubType::MemoryBufferedAndCached => {
                    match (values.get("Buffers"), values.get("Cached")) {
                        (Some(b), Some(c)) => Some(b + c),
                        _ => None,
                    }
                }
                // The aggregate memory metric reports used capacity, so an
                // Upper threshold asserts once used percentage exceeds it.
                SubType::MemoryTotal => values
                    .get("MemAvailable")
                    .map(|available| total_kb.saturating_sub(*available)),
                other => {
                    warn!(metric = %config.name, subtype = ?other, "not a memory subtype, skipping");
                    continue;
                }
            };

            let current = match current_kb {
                Some(kb) => kb as f64 * MEMINFO_BYTES_PER_KB,
                None => {
                    warn!(metric = %config.name, "memory reading missing, sampling as NaN");
                    f64::NAN
                }
            };
            debug!(metric = %config.name, value = current, total, "memory sample");

            samples.insert(config.name.clone(), Sample { current, total });
        }

        Ok(samples)
    }
}

fn read_meminfo(path: &Path) -> SamplerResult<HashMap<String, u64>> {
    let text = fs::read_to_string(path).map_err(|e| SamplerError::SourceUnreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut values = HashMap::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        values.insert(key.trim_end_matches(':').to_string(), value);
    }
    Ok(values)
}

/// Filesystem capacity sampler; `current` is free bytes.
#[derive(Debug, Default)]
pub struct StorageSampler;

/// Filesystem inode sampler; `current` is free inodes.
#[derive(Debug, Default)]
pub struct InodeSampler;

/// Shared statvfs walk for the path-backed samplers. A stat failure on one
/// path is logged and skips only that metric for this tick.
fn sample_paths(
    configs: &[Arc<MetricConfig>],
    read: impl Fn(&nix::sys::statvfs::Statvfs) -> (f64, f64),
) -> SampleSet {
    let mut samples = SampleSet::new();
    for config in configs {
        match nix::sys::statvfs::statvfs(config.path.as_path()) {
            Ok(stat) => {
                let (current, total) = read(&stat);
                debug!(metric = %config.name, value = current, total, "filesystem sample");
                samples.insert(config.name.clone(), Sample { current, total });
            }
            Err(e) => {
                error!(
                    metric = %config.name,
                    path = %config.path.display(),
                    error = %e,
                    "statvfs failed, skipping metric this tick"
                );
            }
        }
    }
    samples
}

impl StorageSampler {
    pub fn sample(&mut self, configs: &[Arc<MetricConfig>]) -> SamplerResult<SampleSet> {
        Ok(sample_paths(configs, |stat| {
            let fragment = stat.fragment_size() as f64;
            (
                stat.blocks_free() as f64 * fragment,
                stat.blocks() as f64 * fragment,
            )
        }))
    }
}

impl InodeSampler {
    pub fn sample(&mut self, configs: &[Arc<MetricConfig>]) -> SamplerResult<SampleSet> {
        Ok(sample_paths(configs, |stat| {
            (stat.files_free() as f64, stat.files() as f64)
        }))
    }
}

/// The sampler for one metric type.
#[derive(Debug)]
pub enum TypeSampler {
    Cpu(CpuSampler),
    Memory(MemorySampler),
    Storage(StorageSampler),
    Inode(InodeSampler),
}

impl TypeSampler {
    pub fn for_type(metric_type: MetricType) -> Self {
        match metric_type {
            MetricType::Cpu => TypeSampler::Cpu(CpuSampler::default()),
            MetricType::Memory => TypeSampler::Memory(MemorySampler::default()),
            MetricType::Storage => TypeSampler::Storage(StorageSampler),
            MetricType::Inode => TypeSampler::Inode(InodeSampler),
        }
    }

    pub fn sample(&mut self, configs: &[Arc<MetricConfig>]) -> SamplerResult<SampleSet> {
        match self {
            TypeSampler::Cpu(sampler) => sampler.sample(configs),
            TypeSampler::Memory(sampler) => sampler.sample(configs),
            TypeSampler::Storage(sampler) => sampler.sample(configs),
            TypeSampler::Inode(sampler) => sampler.sample(configs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn config(name: &str, subtype: SubType) -> Arc<MetricConfig> {
        Arc::new(MetricConfig {
            name: name.to_string(),
            subtype,
            window_size: 1,
            hysteresis: 0.0,
            path: PathBuf::new(),
            thresholds: BTreeMap::new(),
        })
    }

    fn write_stat(dir: &TempDir, line: &str) -> PathBuf {
        let path = dir.path().join("stat");
        fs::write(&path, format!("{line}\ncpu0 1 2 3 4 5 6 7 8 9 10\n")).unwrap();
        path
    }

    #[test]
    fn test_cpu_delta_between_ticks() {
        let dir = TempDir::new().unwrap();
        let path = write_stat(&dir, "cpu 100 0 0 900 0 0 0 0 0 0");

        let mut sampler = CpuSampler::with_source(&path);
        let configs = vec![config("CPU", SubType::CpuTotal)];

        // First tick measures against zeroed counters (since boot).
        let samples = sampler.sample(&configs).unwrap();
        let first = samples["CPU"];
        assert!((first.current - 10.0).abs() < 1e-9);
        assert_eq!(first.total, 100.0);

        // 950 active out of 1000 total new jiffies: 95 %.
        fs::write(&path, "cpu 1050 0 0 950 0 0 0 0 0 0\n").unwrap();
        let samples = sampler.sample(&configs).unwrap();
        assert!((samples["CPU"].current - 95.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_subtypes_do_not_interfere() {
        let dir = TempDir::new().unwrap();
        let path = write_stat(&dir, "cpu 400 0 100 500 0 0 0 0 0 0");

        let mut sampler = CpuSampler::with_source(&path);
        let configs = vec![
            config("CPU", SubType::CpuTotal),
            config("CPU_Kernel", SubType::CpuKernel),
            config("CPU_User", SubType::CpuUser),
        ];

        let samples = sampler.sample(&configs).unwrap();
        assert!((samples["CPU"].current - 50.0).abs() < 1e-9);
        assert!((samples["CPU_Kernel"].current - 10.0).abs() < 1e-9);
        assert!((samples["CPU_User"].current - 40.0).abs() < 1e-9);

        // Only kernel time advances; each subtype keeps its own baseline.
        fs::write(&path, "cpu 400 0 200 500 0 0 0 0 0 0\n").unwrap();
        let samples = sampler.sample(&configs).unwrap();
        assert!((samples["CPU_Kernel"].current - 100.0).abs() < 1e-9);
        assert!((samples["CPU_User"].current - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_zero_total_delta_is_nan() {
        let dir = TempDir::new().unwrap();
        let path = write_stat(&dir, "cpu 100 0 0 900 0 0 0 0 0 0");

        let mut sampler = CpuSampler::with_source(&path);
        let configs = vec![config("CPU", SubType::CpuTotal)];

        sampler.sample(&configs).unwrap();
        // Same counters again: no jiffies elapsed.
        let samples = sampler.sample(&configs).unwrap();
        assert!(samples["CPU"].current.is_nan());
    }

    #[test]
    fn test_cpu_missing_label_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stat");
        fs::write(&path, "intr 100 0 0 900 0 0 0 0 0 0\n").unwrap();

        let mut sampler = CpuSampler::with_source(&path);
        let err = sampler
            .sample(&[config("CPU", SubType::CpuTotal)])
            .unwrap_err();
        assert!(matches!(err, SamplerError::MissingCpuLabel { .. }));
        assert!(sampler.previous.is_empty());
    }

    #[test]
    fn test_cpu_truncated_line_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stat");
        fs::write(&path, "cpu 100 0 0 900\n").unwrap();

        let mut sampler = CpuSampler::with_source(&path);
        let err = sampler
            .sample(&[config("CPU", SubType::CpuTotal)])
            .unwrap_err();
        assert!(matches!(
            err,
            SamplerError::TruncatedCpuLine { count: 4, .. }
        ));
        // Failed reads must not update the previous counters.
        assert!(sampler.previous.is_empty());
    }

    fn write_meminfo(dir: &TempDir, total: u64, available: u64) -> PathBuf {
        let path = dir.path().join("meminfo");
        fs::write(
            &path,
            format!(
                "MemTotal:       {total} kB\n\
                 MemFree:        200 kB\n\
                 MemAvailable:   {available} kB\n\
                 Buffers:        30 kB\n\
                 Cached:         70 kB\n\
                 Shmem:          10 kB\n"
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_memory_subtype_values() {
        let dir = TempDir::new().unwrap();
        let path = write_meminfo(&dir, 1500, 1351);

        let mut sampler = MemorySampler::with_source(&path);
        let configs = vec![
            config("Memory", SubType::MemoryTotal),
            config("Memory_Available", SubType::MemoryAvailable),
            config("Memory_Free", SubType::MemoryFree),
            config("Memory_Shared", SubType::MemoryShared),
            config("Memory_Buffered_And_Cached", SubType::MemoryBufferedAndCached),
        ];

        let samples = sampler.sample(&configs).unwrap();
        let total = 1500.0 * 1024.0;
        assert_eq!(samples["Memory_Available"].current, 1351.0 * 1024.0);
        assert_eq!(samples["Memory_Available"].total, total);
        assert_eq!(samples["Memory_Free"].current, 200.0 * 1024.0);
        assert_eq!(samples["Memory_Shared"].current, 10.0 * 1024.0);
        assert_eq!(
            samples["Memory_Buffered_And_Cached"].current,
            100.0 * 1024.0
        );
        // The aggregate metric has used polarity.
        assert_eq!(samples["Memory"].current, 149.0 * 1024.0);
    }

    #[test]
    fn test_memory_missing_total_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meminfo");
        fs::write(&path, "MemFree: 200 kB\n").unwrap();

        let mut sampler = MemorySampler::with_source(&path);
        let err = sampler
            .sample(&[config("Memory_Free", SubType::MemoryFree)])
            .unwrap_err();
        assert!(matches!(
            err,
            SamplerError::MissingMemoryKey { key: "MemTotal", .. }
        ));
    }

    #[test]
    fn test_memory_missing_subtype_is_nan() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meminfo");
        fs::write(&path, "MemTotal: 1500 kB\n").unwrap();

        let mut sampler = MemorySampler::with_source(&path);
        let samples = sampler
            .sample(&[config("Memory_Shared", SubType::MemoryShared)])
            .unwrap();
        assert!(samples["Memory_Shared"].current.is_nan());
    }

    #[test]
    fn test_storage_sample_reports_free_and_total_bytes() {
        let dir = TempDir::new().unwrap();
        let mut cfg = MetricConfig {
            name: "Storage_Test".to_string(),
            subtype: SubType::Na,
            window_size: 1,
            hysteresis: 0.0,
            path: dir.path().to_path_buf(),
            thresholds: BTreeMap::new(),
        };

        let mut sampler = StorageSampler;
        let samples = sampler.sample(&[Arc::new(cfg.clone())]).unwrap();
        let sample = samples["Storage_Test"];
        assert!(sample.total > 0.0);
        assert!(sample.current <= sample.total);

        // A bad path yields no sample, not an error for the whole type.
        cfg.path = dir.path().join("gone");
        let samples = sampler.sample(&[Arc::new(cfg)]).unwrap();
        assert!(samples.is_empty());
    }

    #[test]
    fn test_inode_sample() {
        let dir = TempDir::new().unwrap();
        let cfg = Arc::new(MetricConfig {
            name: "Inode_Test".to_string(),
            subtype: SubType::Na,
            window_size: 1,
            hysteresis: 0.0,
            path: dir.path().to_path_buf(),
            thresholds: BTreeMap::new(),
        });

        let mut sampler = InodeSampler;
        let samples = sampler.sample(&[cfg]).unwrap();
        let sample = samples["Inode_Test"];
        assert!(sample.total > 0.0);
        assert!(sample.current <= sample.total);
    }
}
