//! Object-property bus surface
//!
//! Each health metric owns one bus object exposing a Value interface, a
//! Threshold interface and the measuring/measured_by associations to the
//! BMC inventory. The daemon runs against the [`PropertyBus`] trait; real
//! message-bus plumbing stays outside this crate, and the in-process
//! [`InMemoryBus`] implementation backs the HTTP read surface and tests.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Serialize;

use crate::error::BusError;
use crate::metric_config::{Bound, ThresholdType};

/// Unit of a published metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Unit {
    Percent,
    Bytes,
}

/// Association linking a metric object to the inventory object it measures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Association {
    pub forward: &'static str,
    pub reverse: &'static str,
    pub endpoint: String,
}

/// This metric is "measuring" the BMC; the BMC is "measured_by" the metric.
pub const FORWARD_ASSOCIATION: &str = "measuring";
pub const REVERSE_ASSOCIATION: &str = "measured_by";

impl Association {
    pub fn measuring(endpoint: impl Into<String>) -> Self {
        Self {
            forward: FORWARD_ASSOCIATION,
            reverse: REVERSE_ASSOCIATION,
            endpoint: endpoint.into(),
        }
    }
}

/// Snapshot of one metric object's published properties.
///
/// Threshold and assertion keys are rendered as `<Severity>_<Bound>`
/// strings so the object serializes directly onto the read surface.
#[derive(Debug, Clone, Serialize)]
pub struct MetricObject {
    pub value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub unit: Unit,
    pub thresholds: BTreeMap<String, f64>,
    pub asserted: Vec<String>,
    pub associations: Vec<Association>,
}

/// Signal emitted when a threshold key changes assert state.
#[derive(Debug, Clone, Serialize)]
pub struct AssertionChange {
    pub severity: ThresholdType,
    pub bound: Bound,
    pub asserted: bool,
    pub value: f64,
}

/// The daemon's property-publication seam.
///
/// Property reads are snapshot reads of already-published state; each
/// method is atomic with respect to one object.
pub trait PropertyBus: Send + Sync {
    fn register(&self, path: &str, object: MetricObject) -> Result<(), BusError>;
    fn set_value(&self, path: &str, value: f64) -> Result<(), BusError>;
    fn set_asserted(&self, path: &str, asserted: Vec<String>) -> Result<(), BusError>;
    fn assertion_changed(&self, path: &str, change: AssertionChange) -> Result<(), BusError>;
    fn snapshot(&self) -> BTreeMap<String, MetricObject>;
}

/// In-process bus: a locked object map plus a bounded signal history.
pub struct InMemoryBus {
    objects: RwLock<BTreeMap<String, MetricObject>>,
    signals: RwLock<Vec<(String, AssertionChange)>>,
}

/// Retained signal history; old entries are dropped past this.
const SIGNAL_HISTORY: usize = 256;

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            signals: RwLock::new(Vec::new()),
        }
    }

    /// Recent assertion-changed signals, oldest first.
    pub fn signals(&self) -> Vec<(String, AssertionChange)> {
        match self.signals.read() {
            Ok(signals) => signals.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn object(&self, path: &str) -> Option<MetricObject> {
        match self.objects.read() {
            Ok(objects) => objects.get(path).cloned(),
            Err(poisoned) => poisoned.into_inner().get(path).cloned(),
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyBus for InMemoryBus {
    fn register(&self, path: &str, object: MetricObject) -> Result<(), BusError> {
        let mut objects = self.objects.write().unwrap_or_else(|p| p.into_inner());
        if objects.contains_key(path) {
            return Err(BusError::DuplicateObject {
                path: path.to_string(),
            });
        }
        objects.insert(path.to_string(), object);
        Ok(())
    }

    fn set_value(&self, path: &str, value: f64) -> Result<(), BusError> {
        let mut objects = self.objects.write().unwrap_or_else(|p| p.into_inner());
        let object = objects.get_mut(path).ok_or_else(|| BusError::UnknownObject {
            path: path.to_string(),
        })?;
        object.value = value;
        Ok(())
    }

    fn set_asserted(&self, path: &str, asserted: Vec<String>) -> Result<(), BusError> {
        let mut objects = self.objects.write().unwrap_or_else(|p| p.into_inner());
        let object = objects.get_mut(path).ok_or_else(|| BusError::UnknownObject {
            path: path.to_string(),
        })?;
        object.asserted = asserted;
        Ok(())
    }

    fn assertion_changed(&self, path: &str, change: AssertionChange) -> Result<(), BusError> {
        let mut signals = self.signals.write().unwrap_or_else(|p| p.into_inner());
        if signals.len() >= SIGNAL_HISTORY {
            signals.remove(0);
        }
        signals.push((path.to_string(), change));
        Ok(())
    }

    fn snapshot(&self) -> BTreeMap<String, MetricObject> {
        match self.objects.read() {
            Ok(objects) => objects.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
