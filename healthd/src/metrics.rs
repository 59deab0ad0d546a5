//! Daemon telemetry and HTTP read surface
//!
//! This module exports the daemon's own operational counters and the live
//! health metric values through a Prometheus registry, and serves them
//! together with a JSON snapshot of the property bus over a small HTTP
//! endpoint for out-of-band tooling.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::bus::{MetricObject, PropertyBus};
use crate::config::MetricsSection;
use crate::error::{MetricsError, MetricsResult};

/// Operational counters and live metric gauges.
pub struct DaemonMetrics {
    registry: Registry,

    /// Completed sampling ticks.
    pub ticks: IntCounter,

    /// Type-wide sampler failures, labeled by metric type.
    pub sampler_failures: IntCounterVec,

    /// Metrics updated per tick, summed.
    pub metrics_updated: IntCounter,

    /// Last published value per metric object.
    pub metric_value: GaugeVec,

    /// Currently asserted threshold keys per metric object.
    pub thresholds_asserted: IntGaugeVec,
}

impl DaemonMetrics {
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();

        let ticks = IntCounter::new("health_ticks_total", "Completed sampling ticks")
            .map_err(registration_failed)?;
        registry
            .register(Box::new(ticks.clone()))
            .map_err(registration_failed)?;

        let sampler_failures = IntCounterVec::new(
            Opts::new(
                "health_sampler_failures_total",
                "Type-wide sampler failures",
            ),
            &["metric_type"],
        )
        .map_err(registration_failed)?;
        registry
            .register(Box::new(sampler_failures.clone()))
            .map_err(registration_failed)?;

        let metrics_updated = IntCounter::new(
            "health_metrics_updated_total",
            "Health metrics updated with a sample",
        )
        .map_err(registration_failed)?;
        registry
            .register(Box::new(metrics_updated.clone()))
            .map_err(registration_failed)?;

        let metric_value = GaugeVec::new(
            Opts::new("health_metric_value", "Last published metric value"),
            &["object"],
        )
        .map_err(registration_failed)?;
        registry
            .register(Box::new(metric_value.clone()))
            .map_err(registration_failed)?;

        let thresholds_asserted = IntGaugeVec::new(
            Opts::new(
                "health_thresholds_asserted",
                "Currently asserted threshold keys",
            ),
            &["object"],
        )
        .map_err(registration_failed)?;
        registry
            .register(Box::new(thresholds_asserted.clone()))
            .map_err(registration_failed)?;

        Ok(Self {
            registry,
            ticks,
            sampler_failures,
            metrics_updated,
            metric_value,
            thresholds_asserted,
        })
    }

    /// Mirror the property-bus snapshot into the exported gauges.
    pub fn update_from_snapshot(&self, snapshot: &BTreeMap<String, MetricObject>) {
        for (path, object) in snapshot {
            self.metric_value
                .with_label_values(&[path.as_str()])
                .set(object.value);
            self.thresholds_asserted
                .with_label_values(&[path.as_str()])
                .set(object.asserted.len() as i64);
        }
    }

    /// Render the registry in Prometheus text format.
    pub fn encode(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode_to_string(&families)
            .map_err(|e| MetricsError::ExportFailed {
                reason: e.to_string(),
            })
    }
}

fn registration_failed(e: prometheus::Error) -> MetricsError {
    MetricsError::RegistrationFailed {
        name: e.to_string(),
    }
}

/// Serve `/metrics`, `/health` and `/objects` on the configured address.
/// Spawns the server task; with `port = 0` the surface stays disabled.
pub async fn serve(
    config: &MetricsSection,
    metrics: Arc<DaemonMetrics>,
    bus: Arc<dyn PropertyBus>,
) -> MetricsResult<()> {
    if !config.enabled || config.port == 0 {
        tracing::info!("metrics endpoint disabled");
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .map_err(|e: std::net::AddrParseError| MetricsError::ServerFailed {
            reason: e.to_string(),
        })?;

    let builder =
        hyper::Server::try_bind(&addr).map_err(|e| MetricsError::ServerFailed {
            reason: e.to_string(),
        })?;

    tokio::spawn(async move {
        let make_svc = hyper::service::make_service_fn(move |_conn| {
            let metrics = metrics.clone();
            let bus = bus.clone();
            async move {
                Ok::<_, hyper::Error>(hyper::service::service_fn(move |req| {
                    let metrics = metrics.clone();
                    let bus = bus.clone();
                    async move { handle_request(req, metrics, bus) }
                }))
            }
        });

        let server = builder.serve(make_svc);
        tracing::info!(%addr, "metrics endpoint listening");

        if let Err(e) = server.await {
            tracing::error!(error = %e, "metrics endpoint failed");
        }
    });

    Ok(())
}

fn handle_request(
    req: hyper::Request<hyper::Body>,
    metrics: Arc<DaemonMetrics>,
    bus: Arc<dyn PropertyBus>,
) -> std::result::Result<hyper::Response<hyper::Body>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(output) => text_response(200, "text/plain; version=0.0.4", output),
            Err(e) => text_response(500, "text/plain", e.to_string()),
        },
        "/health" => text_response(200, "text/plain", "OK".to_string()),
        "/objects" => match serde_json::to_string_pretty(&bus.snapshot()) {
            Ok(json) => text_response(200, "application/json", json),
            Err(e) => text_response(500, "text/plain", e.to_string()),
        },
        _ => text_response(404, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

fn text_response(
    status: u16,
    content_type: &str,
    body: String,
) -> hyper::Response<hyper::Body> {
    hyper::Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(hyper::Body::from(body))
        .unwrap_or_else(|_| hyper::Response::new(hyper::Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Association, Unit};

    fn object(value: f64, asserted: Vec<String>) -> MetricObject {
        MetricObject {
            value,
            min_value: 0.0,
            max_value: 100.0,
            unit: Unit::Percent,
            thresholds: BTreeMap::new(),
            asserted,
            associations: vec![Association::measuring("/inv/bmc")],
        }
    }

    #[test]
    fn test_counters_register_and_export() {
        let metrics = DaemonMetrics::new().unwrap();
        metrics.ticks.inc();
        metrics
            .sampler_failures
            .with_label_values(&["CPU"])
            .inc();

        let output = metrics.encode().unwrap();
        assert!(output.contains("health_ticks_total"));
        assert!(output.contains("health_sampler_failures_total"));
    }

    #[test]
    fn test_snapshot_mirrors_into_gauges() {
        let metrics = DaemonMetrics::new().unwrap();
        let mut snapshot = BTreeMap::new();
        snapshot.insert(
            "/metric/bmc/total_cpu".to_string(),
            object(42.0, vec!["Critical_Upper".to_string()]),
        );

        metrics.update_from_snapshot(&snapshot);

        assert_eq!(
            metrics
                .metric_value
                .with_label_values(&["/metric/bmc/total_cpu"])
                .get(),
            42.0
        );
        assert_eq!(
            metrics
                .thresholds_asserted
                .with_label_values(&["/metric/bmc/total_cpu"])
                .get(),
            1
        );
    }
}
