//! Health metric configuration model
//!
//! This module defines the immutable description of every tracked metric:
//! its type and subtype, sampling window, hysteresis, optional filesystem
//! path, and the map of configured thresholds. Configurations are produced
//! once at startup by deep-merging an optional platform JSON document over
//! the built-in default document; the result is shared read-only with the
//! running metrics.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ConfigResult};

/// Default location of the platform override document.
pub const DEFAULT_HEALTH_CONFIG_PATH: &str = "/etc/healthmon/bmc_health_config.json";

/// Metric type, grouping metrics that share one raw sampler.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MetricType {
    Cpu,
    Memory,
    Storage,
    Inode,
}

/// The specific quantity tracked within a metric type.
///
/// `Na` covers per-path metrics (storage, inode) that are named dynamically
/// by their configuration key rather than by a fixed subtype.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SubType {
    CpuTotal,
    CpuKernel,
    CpuUser,
    MemoryAvailable,
    MemoryBufferedAndCached,
    MemoryFree,
    MemoryShared,
    MemoryTotal,
    Na,
}

/// Threshold severity, ordered from most to least severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ThresholdType {
    HardShutdown,
    SoftShutdown,
    PerformanceLoss,
    Critical,
    Warning,
}

/// Direction of a threshold comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Bound {
    Lower,
    Upper,
}

/// A (severity, bound) pair; at most one threshold config exists per key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ThresholdKey {
    pub severity: ThresholdType,
    pub bound: Bound,
}

impl ThresholdKey {
    pub fn new(severity: ThresholdType, bound: Bound) -> Self {
        Self { severity, bound }
    }
}

impl fmt::Display for ThresholdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThresholdType::HardShutdown => "HardShutdown",
            ThresholdType::SoftShutdown => "SoftShutdown",
            ThresholdType::PerformanceLoss => "PerformanceLoss",
            ThresholdType::Critical => "Critical",
            ThresholdType::Warning => "Warning",
        };
        f.write_str(s)
    }
}

impl FromStr for ThresholdType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "HardShutdown" => Ok(ThresholdType::HardShutdown),
            "SoftShutdown" => Ok(ThresholdType::SoftShutdown),
            "PerformanceLoss" => Ok(ThresholdType::PerformanceLoss),
            "Critical" => Ok(ThresholdType::Critical),
            "Warning" => Ok(ThresholdType::Warning),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Lower => f.write_str("Lower"),
            Bound::Upper => f.write_str("Upper"),
        }
    }
}

impl FromStr for Bound {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "Lower" => Ok(Bound::Lower),
            "Upper" => Ok(Bound::Upper),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ThresholdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.severity, self.bound)
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricType::Cpu => "CPU",
            MetricType::Memory => "Memory",
            MetricType::Storage => "Storage",
            MetricType::Inode => "Inode",
        };
        f.write_str(s)
    }
}

/// Configuration of one threshold on one metric.
///
/// `value` is always a percentage of the metric's sampled `total`, even for
/// byte-valued metrics, so comparisons are uniform across subtypes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThresholdConfig {
    /// Threshold value as a percentage of the metric total (0..100).
    #[serde(rename = "Value", default = "default_threshold_value")]
    pub value: f64,

    /// Whether crossing this threshold produces log entries.
    #[serde(rename = "Log", default)]
    pub log: bool,

    /// Recovery unit to start on assert; empty for none.
    #[serde(rename = "Target", default)]
    pub target: String,

    /// Whether the platform event log should record this threshold.
    #[serde(rename = "SEL", default)]
    pub sel: bool,
}

fn default_threshold_value() -> f64 {
    100.0
}

/// Immutable description of one tracked metric.
#[derive(Debug, Clone)]
pub struct MetricConfig {
    /// Configuration key, e.g. `CPU`, `Memory_Available`, `Storage_RW`.
    pub name: String,
    /// The metric subtype; `Na` for dynamically named path metrics.
    pub subtype: SubType,
    /// Number of samples averaged before thresholds are evaluated.
    pub window_size: usize,
    /// Minimum relative change (%) before the raw value is republished.
    pub hysteresis: f64,
    /// Filesystem path; only meaningful for storage and inode metrics.
    pub path: PathBuf,
    /// Configured thresholds, at most one per (severity, bound) key.
    pub thresholds: BTreeMap<ThresholdKey, ThresholdConfig>,
}

/// Raw per-metric JSON entry, before key parsing and validation.
#[derive(Debug, Deserialize)]
struct RawMetricEntry {
    #[serde(rename = "Window_size", default = "default_window_size")]
    window_size: usize,

    #[serde(rename = "Hysteresis", default = "default_hysteresis")]
    hysteresis: f64,

    #[serde(rename = "Path", default)]
    path: String,

    #[serde(rename = "Threshold", default)]
    threshold: BTreeMap<String, ThresholdConfig>,
}

fn default_window_size() -> usize {
    120
}

fn default_hysteresis() -> f64 {
    1.0
}

/// Built-in default configuration document. A platform override is
/// deep-merged over this at load time.
const DEFAULT_CONFIG: &str = r#"{
    "CPU": {
        "Threshold": {
            "Critical_Upper": {
                "Value": 90.0,
                "Log": true,
                "Target": "",
                "SEL": true
            },
            "Warning_Upper": {
                "Value": 80.0,
                "Log": false,
                "Target": "",
                "SEL": false
            }
        }
    },
    "CPU_User": {
    },
    "CPU_Kernel": {
    },
    "Memory": {
    },
    "Memory_Available": {
        "Threshold": {
            "Critical_Lower": {
                "Value": 15.0,
                "Log": true,
                "Target": "",
                "SEL": true
            }
        }
    },
    "Memory_Free": {
    },
    "Memory_Shared": {
        "Threshold": {
            "Critical_Upper": {
                "Value": 85.0,
                "Log": true,
                "Target": "",
                "SEL": true
            }
        }
    },
    "Memory_Buffered_And_Cached": {
    },
    "Storage_RW": {
        "Path": "/run/initramfs/rw",
        "Threshold": {
            "Critical_Lower": {
                "Value": 15.0,
                "Log": true,
                "Target": "",
                "SEL": true
            }
        }
    },
    "Storage_TMP": {
        "Path": "/tmp",
        "Threshold": {
            "Critical_Lower": {
                "Value": 15.0,
                "Log": true,
                "Target": "",
                "SEL": true
            }
        }
    }
}"#;

/// Resolve a configuration key to its metric type from the name prefix.
fn metric_type_for(name: &str) -> Option<MetricType> {
    let prefix = name.split('_').next().unwrap_or(name);
    match prefix {
        "CPU" => Some(MetricType::Cpu),
        "Memory" => Some(MetricType::Memory),
        "Storage" => Some(MetricType::Storage),
        "Inode" => Some(MetricType::Inode),
        _ => None,
    }
}

/// Resolve a configuration key to its subtype. Keys without a fixed subtype
/// (per-path storage and inode metrics) map to `Na`.
fn subtype_for(name: &str) -> SubType {
    match name {
        "CPU" => SubType::CpuTotal,
        "CPU_User" => SubType::CpuUser,
        "CPU_Kernel" => SubType::CpuKernel,
        "Memory" => SubType::MemoryTotal,
        "Memory_Free" => SubType::MemoryFree,
        "Memory_Available" => SubType::MemoryAvailable,
        "Memory_Shared" => SubType::MemoryShared,
        "Memory_Buffered_And_Cached" => SubType::MemoryBufferedAndCached,
        _ => SubType::Na,
    }
}

/// Parse a `<Type>_<Bound>` threshold key, e.g. `Critical_Upper`.
fn parse_threshold_key(key: &str) -> Option<ThresholdKey> {
    let (severity, bound) = key.rsplit_once('_')?;
    let severity = ThresholdType::from_str(severity).ok()?;
    let bound = Bound::from_str(bound).ok()?;
    Some(ThresholdKey::new(severity, bound))
}

/// RFC 7386 JSON merge-patch: objects merge recursively, null removes a
/// member, any other patch value replaces the target.
fn merge_patch(target: &mut Value, patch: &Value) {
    if let Value::Object(patch_map) = patch {
        if !target.is_object() {
            *target = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(target_map) = target {
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_patch(
                        target_map.entry(key.clone()).or_insert(Value::Null),
                        value,
                    );
                }
            }
        }
    } else {
        *target = patch.clone();
    }
}

/// Parse the platform override document. A missing file is not an error;
/// an unparsable file is logged and ignored so a broken override cannot
/// keep the daemon from starting with defaults.
fn parse_platform_file(path: &Path) -> Option<Value> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            info!(path = %path.display(), error = %e, "platform health config not found, using defaults");
            return None;
        }
    };

    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse platform health config, using defaults");
            None
        }
    }
}

/// Check that a path-backed metric's path can be stat'ed at load time.
///
/// A platform override pointing at a missing mount must not take down the
/// daemon; the entry is skipped with a warning instead.
fn path_is_statable(path: &Path) -> bool {
    nix::sys::statvfs::statvfs(path).is_ok()
}

/// A threshold whose value is not finite is a hard configuration error, not
/// a silently disabled alarm.
fn validate_threshold(
    metric: &str,
    key: &str,
    threshold: &ThresholdConfig,
) -> ConfigResult<()> {
    if !threshold.value.is_finite() {
        return Err(ConfigError::NonFiniteThreshold {
            metric: metric.to_string(),
            key: key.to_string(),
        });
    }
    Ok(())
}

fn build_metric_config(name: &str, entry: Value) -> ConfigResult<MetricConfig> {
    let raw: RawMetricEntry =
        serde_json::from_value(entry).map_err(|e| ConfigError::ParseFailed {
            path: name.to_string(),
            reason: e.to_string(),
        })?;

    if raw.window_size < 1 {
        return Err(ConfigError::InvalidWindowSize {
            metric: name.to_string(),
            value: raw.window_size,
        });
    }
    if !raw.hysteresis.is_finite() || raw.hysteresis < 0.0 {
        return Err(ConfigError::InvalidHysteresis {
            metric: name.to_string(),
            value: raw.hysteresis,
        });
    }

    let mut thresholds = BTreeMap::new();
    for (key, threshold) in raw.threshold {
        let Some(parsed) = parse_threshold_key(&key) else {
            warn!(metric = name, key = %key, "invalid threshold key, skipping");
            continue;
        };
        validate_threshold(name, &key, &threshold)?;
        thresholds.insert(parsed, threshold);
    }

    Ok(MetricConfig {
        name: name.to_string(),
        subtype: subtype_for(name),
        window_size: raw.window_size,
        hysteresis: raw.hysteresis,
        path: PathBuf::from(raw.path),
        thresholds,
    })
}

/// Load the merged metric configurations, grouped by metric type.
///
/// `platform_path` overrides [`DEFAULT_HEALTH_CONFIG_PATH`] when given.
/// Unknown metric-name prefixes are skipped with a warning; a non-finite
/// threshold value or invalid window/hysteresis is a hard error.
pub fn load_metric_configs(
    platform_path: Option<&Path>,
) -> ConfigResult<BTreeMap<MetricType, Vec<MetricConfig>>> {
    let mut merged: Value =
        serde_json::from_str(DEFAULT_CONFIG).map_err(|e| ConfigError::ParseFailed {
            path: "<built-in defaults>".to_string(),
            reason: e.to_string(),
        })?;

    let platform_path =
        platform_path.unwrap_or_else(|| Path::new(DEFAULT_HEALTH_CONFIG_PATH));
    if let Some(platform) = parse_platform_file(platform_path) {
        merge_patch(&mut merged, &platform);
    }

    parse_merged_configs(merged)
}

fn parse_merged_configs(
    merged: Value,
) -> ConfigResult<BTreeMap<MetricType, Vec<MetricConfig>>> {
    let Value::Object(entries) = merged else {
        return Err(ConfigError::ParseFailed {
            path: "<merged config>".to_string(),
            reason: "top level is not an object".to_string(),
        });
    };

    let mut configs: BTreeMap<MetricType, Vec<MetricConfig>> = BTreeMap::new();
    for (name, entry) in entries {
        let Some(metric_type) = metric_type_for(&name) else {
            warn!(metric = %name, "unsupported metric type, skipping");
            continue;
        };

        let config = build_metric_config(&name, entry)?;

        if matches!(metric_type, MetricType::Storage | MetricType::Inode) {
            if config.path.as_os_str().is_empty() {
                warn!(metric = %name, "path metric has no Path configured, skipping");
                continue;
            }
            if !path_is_statable(&config.path) {
                warn!(
                    metric = %name,
                    path = %config.path.display(),
                    "configured path cannot be stat'ed, skipping"
                );
                continue;
            }
        }

        debug!(
            metric = %config.name,
            ?metric_type,
            subtype = ?config.subtype,
            window_size = config.window_size,
            hysteresis = config.hysteresis,
            thresholds = config.thresholds.len(),
            "loaded metric config"
        );
        configs.entry(metric_type).or_default().push(config);
    }

    Ok(configs)
}
