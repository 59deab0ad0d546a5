//! Health metric engine
//!
//! One [`HealthMetric`] tracks one configured quantity: it maintains a
//! bounded sample window, computes the windowed average, evaluates every
//! configured threshold against it with assert/deassert state, throttles
//! raw-value publication with hysteresis, and drives the event-log
//! lifecycle and recovery-unit activation on transitions.
//!
//! The configuration is an immutable snapshot shared behind an `Arc`; all
//! mutable state (window, asserted set, outstanding log handle) lives here
//! and is only ever touched by the sampling tick.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::bus::{AssertionChange, Association, MetricObject, PropertyBus, Unit};
use crate::error::Result;
use crate::events::{EventSink, LogHandle, ThresholdEvent, ThresholdEventName};
use crate::metric_config::{
    Bound, MetricConfig, MetricType, SubType, ThresholdConfig, ThresholdKey,
};
use crate::platform::UnitStarter;
use crate::sampler::Sample;

const PERCENT_MIN: f64 = 0.0;
const PERCENT_MAX: f64 = 100.0;

const METRIC_PATH_BASE: &str = "/xyz/openbmc_project/metric/bmc";

/// Bus object path for a metric. CPU and memory subtypes have fixed
/// leaves; path-backed metrics derive theirs from the configuration name
/// (`Storage_RW` becomes `storage/rw`).
pub fn object_path_for(metric_type: MetricType, config: &MetricConfig) -> String {
    let leaf = match config.subtype {
        SubType::CpuTotal => "total_cpu",
        SubType::CpuKernel => "kernel_cpu",
        SubType::CpuUser => "user_cpu",
        SubType::MemoryAvailable => "available_memory",
        SubType::MemoryBufferedAndCached => "buffered_and_cached_memory",
        SubType::MemoryFree => "free_memory",
        SubType::MemoryShared => "shared_memory",
        SubType::MemoryTotal => "total_memory",
        SubType::Na => {
            let prefix = match metric_type {
                MetricType::Storage => "storage",
                MetricType::Inode => "inode",
                _ => "metric",
            };
            let suffix = config
                .name
                .split_once('_')
                .map(|(_, rest)| rest)
                .unwrap_or(config.name.as_str())
                .to_lowercase();
            return format!("{METRIC_PATH_BASE}/{prefix}/{suffix}");
        }
    };
    format!("{METRIC_PATH_BASE}/{leaf}")
}

fn unit_for(metric_type: MetricType) -> Unit {
    match metric_type {
        MetricType::Cpu => Unit::Percent,
        MetricType::Memory | MetricType::Storage | MetricType::Inode => Unit::Bytes,
    }
}

/// The stateful engine for one configured metric.
pub struct HealthMetric {
    metric_type: MetricType,
    config: Arc<MetricConfig>,
    object_path: String,
    history: VecDeque<f64>,
    asserted: BTreeSet<ThresholdKey>,
    last_notified: f64,
    outstanding: Option<LogHandle>,
    bus: Arc<dyn PropertyBus>,
    events: Arc<dyn EventSink>,
    units: Arc<dyn UnitStarter>,
}

impl HealthMetric {
    /// Create the metric and register its bus object, with the configured
    /// threshold values published and an association to every BMC
    /// inventory path.
    pub fn new(
        metric_type: MetricType,
        config: Arc<MetricConfig>,
        bmc_paths: &[String],
        bus: Arc<dyn PropertyBus>,
        events: Arc<dyn EventSink>,
        units: Arc<dyn UnitStarter>,
    ) -> Result<Self> {
        info!(metric = %config.name, "creating health metric");

        let object_path = object_path_for(metric_type, &config);
        let unit = unit_for(metric_type);

        let thresholds: BTreeMap<String, f64> = config
            .thresholds
            .iter()
            .map(|(key, threshold)| (key.to_string(), threshold.value))
            .collect();

        let (min_value, max_value) = if unit == Unit::Percent {
            (PERCENT_MIN, PERCENT_MAX)
        } else {
            (PERCENT_MIN, f64::NAN)
        };

        bus.register(
            &object_path,
            MetricObject {
                value: f64::NAN,
                min_value,
                max_value,
                unit,
                thresholds,
                asserted: Vec::new(),
                associations: bmc_paths
                    .iter()
                    .map(|path| Association::measuring(path.clone()))
                    .collect(),
            },
        )?;

        Ok(Self {
            metric_type,
            config,
            object_path,
            history: VecDeque::new(),
            asserted: BTreeSet::new(),
            last_notified: f64::NAN,
            outstanding: None,
            bus,
            events,
            units,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    /// Feed one raw sample through the engine.
    pub fn update(&mut self, sample: Sample) {
        self.history.push_back(sample.current);
        while self.history.len() > self.config.window_size {
            self.history.pop_front();
        }

        if self.should_notify(sample.current) {
            self.last_notified = sample.current;
            if let Err(e) = self.bus.set_value(&self.object_path, sample.current) {
                warn!(metric = %self.config.name, error = %e, "failed to publish value");
            }
        }

        // Cold start: thresholds are evaluated only on a full window.
        if self.history.len() < self.config.window_size {
            return;
        }

        let average = self.history.iter().sum::<f64>() / self.history.len() as f64;

        let config = Arc::clone(&self.config);
        for (key, threshold) in &config.thresholds {
            self.check_threshold(*key, threshold, average, sample.total);
        }
    }

    /// Raw-value publication is throttled by hysteresis. NaN always
    /// notifies so a read failure is surfaced immediately, and a NaN
    /// baseline always renotifies so recovery is surfaced too.
    fn should_notify(&self, current: f64) -> bool {
        if current.is_nan() || self.last_notified.is_nan() {
            return true;
        }
        let changed = ((current - self.last_notified) / self.last_notified * 100.0).abs();
        changed >= self.config.hysteresis
    }

    fn check_threshold(
        &mut self,
        key: ThresholdKey,
        threshold: &ThresholdConfig,
        average: f64,
        total: f64,
    ) {
        let absolute = threshold.value / 100.0 * total;
        let violated = match key.bound {
            Bound::Upper => average > absolute,
            Bound::Lower => average < absolute,
        };

        if violated && !self.asserted.contains(&key) {
            self.assert_threshold(key, threshold, average, total);
        } else if !violated && self.asserted.contains(&key) {
            self.deassert_threshold(key, threshold, average, total);
        }
    }

    fn publish_assertions(&self, key: ThresholdKey, asserted: bool, average: f64) {
        let keys = self.asserted.iter().map(ThresholdKey::to_string).collect();
        if let Err(e) = self.bus.set_asserted(&self.object_path, keys) {
            warn!(metric = %self.config.name, error = %e, "failed to publish asserted set");
        }
        let change = AssertionChange {
            severity: key.severity,
            bound: key.bound,
            asserted,
            value: average,
        };
        if let Err(e) = self.bus.assertion_changed(&self.object_path, change) {
            warn!(metric = %self.config.name, error = %e, "failed to signal assertion change");
        }
    }

    fn assert_threshold(
        &mut self,
        key: ThresholdKey,
        threshold: &ThresholdConfig,
        average: f64,
        total: f64,
    ) {
        self.asserted.insert(key);
        self.publish_assertions(key, true, average);

        if threshold.log {
            error!(
                metric = %self.config.name,
                severity = %key.severity,
                bound = %key.bound,
                value = average,
                "ASSERT: health metric crossed threshold"
            );
            self.commit_event(key, threshold, average, total);
        }

        if !threshold.target.is_empty() {
            if let Err(e) = self.units.start_unit(&threshold.target) {
                error!(
                    metric = %self.config.name,
                    unit = %threshold.target,
                    error = %e,
                    "failed to start recovery unit"
                );
            }
        }
    }

    /// At most one open log entry exists per metric, no matter how many of
    /// its thresholds are asserted at once.
    fn commit_event(
        &mut self,
        key: ThresholdKey,
        threshold: &ThresholdConfig,
        average: f64,
        total: f64,
    ) {
        if let Some(outstanding) = &self.outstanding {
            error!(
                metric = %self.config.name,
                entry = %outstanding,
                "dropping threshold event, unresolved entry outstanding"
            );
            return;
        }

        let event = ThresholdEvent {
            metric: self.config.name.clone(),
            event: ThresholdEventName::for_assert(key),
            severity: key.severity,
            bound: key.bound,
            reading: percent_of(average, total),
            threshold: threshold.value,
            unit: Unit::Percent,
            sel: threshold.sel,
            timestamp: Utc::now(),
        };

        match self.events.commit(&event) {
            Ok(handle) => self.outstanding = Some(handle),
            Err(e) => {
                error!(metric = %self.config.name, error = %e, "failed to commit threshold event");
            }
        }
    }

    fn deassert_threshold(
        &mut self,
        key: ThresholdKey,
        threshold: &ThresholdConfig,
        average: f64,
        total: f64,
    ) {
        self.asserted.remove(&key);
        self.publish_assertions(key, false, average);

        if threshold.log {
            info!(
                metric = %self.config.name,
                severity = %key.severity,
                bound = %key.bound,
                value = average,
                "DEASSERT: health metric cleared threshold"
            );
        }

        // The outstanding entry resolves only once every threshold has
        // cleared; any still-asserted key keeps it open.
        if self.asserted.is_empty() {
            if let Some(handle) = self.outstanding.take() {
                let reading = percent_of(average, total);
                if let Err(e) = self.events.resolve(&handle, &self.config.name, reading) {
                    error!(metric = %self.config.name, error = %e, "failed to resolve threshold event");
                }
                if let Err(e) = self.events.reading_normal(&self.config.name, reading) {
                    error!(metric = %self.config.name, error = %e, "failed to record normal reading");
                }
            }
        }
    }
}

fn percent_of(value: f64, total: f64) -> f64 {
    100.0 * value / total
}
