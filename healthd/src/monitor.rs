//! Top-level health monitor
//!
//! [`HealthMonitor`] owns one metric collection per configured type and
//! drives the periodic sampling loop. [`HealthService`] wires the monitor
//! to its collaborators (property bus, event sink, unit starter, telemetry)
//! from the daemon configuration and runs it until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::bus::{InMemoryBus, PropertyBus};
use crate::collection::HealthMetricCollection;
use crate::config::MonitorConfig;
use crate::error::Result;
use crate::events::{EventSink, LocalEventLog};
use crate::metric_config::{load_metric_configs, MetricType};
use crate::metrics::DaemonMetrics;
use crate::platform::{
    InventorySource, LoggingStarter, StaticInventory, SystemctlStarter, UnitStarter,
};

/// Statistics for one monitor tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickStats {
    pub metrics_updated: usize,
    pub sampler_failures: usize,
}

/// Owns every metric collection and the sampling cadence.
pub struct HealthMonitor {
    interval: Duration,
    collections: Vec<HealthMetricCollection>,
}

impl HealthMonitor {
    pub fn new(
        config: &MonitorConfig,
        inventory: &dyn InventorySource,
        bus: Arc<dyn PropertyBus>,
        events: Arc<dyn EventSink>,
        units: Arc<dyn UnitStarter>,
    ) -> Result<Self> {
        let metric_configs = load_metric_configs(config.monitor.health_config.as_deref())?;
        let bmc_paths = inventory.bmc_inventory_paths();
        info!(
            types = metric_configs.len(),
            inventory_paths = bmc_paths.len(),
            "creating health monitor"
        );

        let mut collections = Vec::new();
        for (metric_type, configs) in metric_configs {
            collections.push(HealthMetricCollection::new(
                metric_type,
                configs,
                &bmc_paths,
                Arc::clone(&bus),
                Arc::clone(&events),
                Arc::clone(&units),
            )?);
        }

        Ok(Self {
            interval: Duration::from_secs(config.monitor.interval_secs),
            collections,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Collection metric types, for introspection.
    pub fn metric_types(&self) -> Vec<MetricType> {
        self.collections.iter().map(|c| c.metric_type()).collect()
    }

    /// Run one sampling pass over every collection.
    pub fn tick(&mut self, telemetry: &DaemonMetrics) -> TickStats {
        let mut stats = TickStats::default();
        for collection in &mut self.collections {
            debug!(metric_type = %collection.metric_type(), "reading collection");
            let outcome = collection.read();
            stats.metrics_updated += outcome.updated;
            if outcome.sampler_failed {
                stats.sampler_failures += 1;
                let label = collection.metric_type().to_string();
                telemetry
                    .sampler_failures
                    .with_label_values(&[label.as_str()])
                    .inc();
            }
        }
        telemetry.ticks.inc();
        telemetry.metrics_updated.inc_by(stats.metrics_updated as u64);
        stats
    }

    /// Drive the sampling loop until a shutdown is signalled.
    pub async fn run(
        &mut self,
        telemetry: Arc<DaemonMetrics>,
        bus: Arc<dyn PropertyBus>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval = ?self.interval, "health monitor running");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.tick(&telemetry);
                    telemetry.update_from_snapshot(&bus.snapshot());
                    debug!(
                        updated = stats.metrics_updated,
                        failures = stats.sampler_failures,
                        "tick complete"
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health monitor stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// The assembled daemon: monitor plus its collaborators.
pub struct HealthService {
    config: MonitorConfig,
    monitor: HealthMonitor,
    bus: Arc<InMemoryBus>,
    events: Arc<LocalEventLog>,
    telemetry: Arc<DaemonMetrics>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthService {
    /// Build the service from daemon configuration.
    pub fn new(config: MonitorConfig) -> Result<Self> {
        info!("initializing health service");

        let bus = Arc::new(InMemoryBus::new());
        let events = Arc::new(LocalEventLog::new());
        let telemetry = Arc::new(DaemonMetrics::new()?);

        let units: Arc<dyn UnitStarter> = if config.activation.enabled {
            Arc::new(SystemctlStarter)
        } else {
            Arc::new(LoggingStarter::new())
        };

        let inventory = StaticInventory::new(config.inventory.bmc_paths.clone());

        let monitor = HealthMonitor::new(
            &config,
            &inventory,
            bus.clone() as Arc<dyn PropertyBus>,
            events.clone() as Arc<dyn EventSink>,
            units,
        )?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            monitor,
            bus,
            events,
            telemetry,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn bus(&self) -> Arc<InMemoryBus> {
        self.bus.clone()
    }

    pub fn events(&self) -> Arc<LocalEventLog> {
        self.events.clone()
    }

    /// Request a graceful stop of the sampling loop.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Run one sampling pass without entering the loop.
    pub fn sample_once(&mut self) -> TickStats {
        let stats = self.monitor.tick(&self.telemetry);
        self.telemetry.update_from_snapshot(&self.bus.snapshot());
        stats
    }

    /// Start the metrics endpoint and run the sampling loop to completion.
    pub async fn run(&mut self) -> Result<()> {
        crate::metrics::serve(
            &self.config.metrics,
            self.telemetry.clone(),
            self.bus.clone() as Arc<dyn PropertyBus>,
        )
        .await?;

        let shutdown = self.shutdown_rx.clone();
        self.monitor
            .run(
                self.telemetry.clone(),
                self.bus.clone() as Arc<dyn PropertyBus>,
                shutdown,
            )
            .await;

        info!("health service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn service_config() -> MonitorConfig {
        let mut config = MonitorConfig::default();
        // No platform override: the built-in defaults apply, and default
        // storage entries whose paths do not exist here are skipped at
        // load time.
        config.monitor.health_config = Some(PathBuf::from("/nonexistent-override.json"));
        config.activation.enabled = false;
        config
    }

    #[test]
    fn test_service_builds_collections_from_defaults() {
        let mut service = HealthService::new(service_config()).unwrap();

        let types = service.monitor.metric_types();
        assert!(types.contains(&MetricType::Cpu));
        assert!(types.contains(&MetricType::Memory));

        // Objects for every default CPU and memory metric are registered.
        let snapshot = service.bus.snapshot();
        assert!(snapshot.contains_key("/xyz/openbmc_project/metric/bmc/total_cpu"));
        assert!(snapshot.contains_key("/xyz/openbmc_project/metric/bmc/available_memory"));

        // One synchronous pass samples the real /proc sources.
        let stats = service.sample_once();
        assert!(stats.metrics_updated > 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut service = HealthService::new(service_config()).unwrap();
        let shutdown = service.shutdown_handle();

        let handle = tokio::spawn(async move {
            let _ = service.run().await;
        });

        // Give the loop a moment, then ask it to stop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(true).ok();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("service did not stop")
            .unwrap();
    }
}
