//! Per-type metric collections
//!
//! A collection groups every health metric of one type, owns that type's
//! raw sampler, and fans one sampling pass out to each metric. A sampler
//! failure for the whole type aborts the tick for that type only.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::bus::PropertyBus;
use crate::error::Result;
use crate::events::EventSink;
use crate::metric::HealthMetric;
use crate::metric_config::{MetricConfig, MetricType};
use crate::platform::UnitStarter;
use crate::sampler::TypeSampler;

/// Outcome of one sampling pass over a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Metrics that received a sample this tick.
    pub updated: usize,
    /// Whether the type-wide sampler call failed.
    pub sampler_failed: bool,
}

pub struct HealthMetricCollection {
    metric_type: MetricType,
    configs: Vec<Arc<MetricConfig>>,
    sampler: TypeSampler,
    metrics: Vec<HealthMetric>,
}

impl HealthMetricCollection {
    pub fn new(
        metric_type: MetricType,
        configs: Vec<MetricConfig>,
        bmc_paths: &[String],
        bus: Arc<dyn PropertyBus>,
        events: Arc<dyn EventSink>,
        units: Arc<dyn UnitStarter>,
    ) -> Result<Self> {
        Self::with_sampler(
            metric_type,
            TypeSampler::for_type(metric_type),
            configs,
            bmc_paths,
            bus,
            events,
            units,
        )
    }

    /// Construct with an explicit sampler, so callers can point the
    /// proc-style readers at alternate sources.
    pub fn with_sampler(
        metric_type: MetricType,
        sampler: TypeSampler,
        configs: Vec<MetricConfig>,
        bmc_paths: &[String],
        bus: Arc<dyn PropertyBus>,
        events: Arc<dyn EventSink>,
        units: Arc<dyn UnitStarter>,
    ) -> Result<Self> {
        info!(metric_type = %metric_type, count = configs.len(), "creating metric collection");

        let configs: Vec<Arc<MetricConfig>> = configs.into_iter().map(Arc::new).collect();
        let mut metrics = Vec::with_capacity(configs.len());
        for config in &configs {
            metrics.push(HealthMetric::new(
                metric_type,
                Arc::clone(config),
                bmc_paths,
                Arc::clone(&bus),
                Arc::clone(&events),
                Arc::clone(&units),
            )?);
        }

        Ok(Self {
            metric_type,
            configs,
            sampler,
            metrics,
        })
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Run one sampling pass and update every owned metric.
    pub fn read(&mut self) -> ReadOutcome {
        let samples = match self.sampler.sample(&self.configs) {
            Ok(samples) => samples,
            Err(e) => {
                error!(
                    metric_type = %self.metric_type,
                    error = %e,
                    "sampler failed, skipping tick for this type"
                );
                return ReadOutcome {
                    updated: 0,
                    sampler_failed: true,
                };
            }
        };

        let mut updated = 0;
        for metric in &mut self.metrics {
            match samples.get(metric.name()) {
                Some(sample) => {
                    metric.update(*sample);
                    updated += 1;
                }
                None => {
                    // Per-metric read failure; the sampler already logged it.
                    debug!(metric = %metric.name(), "no sample this tick");
                }
            }
        }

        ReadOutcome {
            updated,
            sampler_failed: false,
        }
    }
}
