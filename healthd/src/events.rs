//! Structured threshold event log
//!
//! Threshold crossings commit resolvable log entries keyed by the
//! (severity, bound) pair; clearing the last asserted threshold resolves
//! the outstanding entry and records a back-to-normal event. The
//! [`EventSink`] trait is the seam to the platform's log service; the
//! default [`LocalEventLog`] implementation logs through tracing and keeps
//! a bounded in-memory record for the read surface and tests.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::bus::Unit;
use crate::error::EventError;
use crate::metric_config::{Bound, ThresholdKey, ThresholdType};

/// Event name committed for a threshold crossing, mapped exhaustively from
/// the (severity, bound) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThresholdEventName {
    ReadingAboveUpperCritical,
    ReadingBelowLowerCritical,
    ReadingAboveUpperWarning,
    ReadingBelowLowerWarning,
    ReadingNormal,
}

impl ThresholdEventName {
    /// Event committed when `key` asserts. Shutdown-class severities share
    /// the critical reading events; performance loss shares the warning
    /// ones.
    pub fn for_assert(key: ThresholdKey) -> Self {
        match (key.severity, key.bound) {
            (
                ThresholdType::HardShutdown
                | ThresholdType::SoftShutdown
                | ThresholdType::Critical,
                Bound::Upper,
            ) => ThresholdEventName::ReadingAboveUpperCritical,
            (
                ThresholdType::HardShutdown
                | ThresholdType::SoftShutdown
                | ThresholdType::Critical,
                Bound::Lower,
            ) => ThresholdEventName::ReadingBelowLowerCritical,
            (ThresholdType::PerformanceLoss | ThresholdType::Warning, Bound::Upper) => {
                ThresholdEventName::ReadingAboveUpperWarning
            }
            (ThresholdType::PerformanceLoss | ThresholdType::Warning, Bound::Lower) => {
                ThresholdEventName::ReadingBelowLowerWarning
            }
        }
    }
}

impl fmt::Display for ThresholdEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThresholdEventName::ReadingAboveUpperCritical => "ReadingAboveUpperCritical",
            ThresholdEventName::ReadingBelowLowerCritical => "ReadingBelowLowerCritical",
            ThresholdEventName::ReadingAboveUpperWarning => "ReadingAboveUpperWarning",
            ThresholdEventName::ReadingBelowLowerWarning => "ReadingBelowLowerWarning",
            ThresholdEventName::ReadingNormal => "ReadingNormal",
        };
        f.write_str(s)
    }
}

/// One committed threshold event.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdEvent {
    pub metric: String,
    pub event: ThresholdEventName,
    pub severity: ThresholdType,
    pub bound: Bound,
    /// Reading at the time of the crossing, as a percentage of total.
    pub reading: f64,
    /// Configured threshold value, as a percentage of total.
    pub threshold: f64,
    pub unit: Unit,
    /// Whether the platform event log should also record this entry.
    pub sel: bool,
    pub timestamp: DateTime<Utc>,
}

/// Opaque handle to an open, resolvable log entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LogHandle(Uuid);

impl fmt::Display for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Seam to the structured log service. Commit opens a resolvable entry;
/// resolve closes it.
pub trait EventSink: Send + Sync {
    fn commit(&self, event: &ThresholdEvent) -> Result<LogHandle, EventError>;
    fn resolve(&self, handle: &LogHandle, metric: &str, reading: f64)
        -> Result<(), EventError>;
    fn reading_normal(&self, metric: &str, reading: f64) -> Result<(), EventError>;
}

/// Record of sink activity retained by [`LocalEventLog`].
#[derive(Debug, Clone, Serialize)]
pub enum EventRecord {
    Committed(ThresholdEvent),
    Resolved { metric: String, reading: f64 },
    Normal { metric: String, reading: f64 },
}

const RECORD_HISTORY: usize = 256;

/// Default sink: tracing output plus a bounded in-memory record.
pub struct LocalEventLog {
    open: Mutex<HashMap<LogHandle, String>>,
    records: Mutex<VecDeque<EventRecord>>,
}

impl LocalEventLog {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn open_entry_count(&self) -> usize {
        self.open.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn push_record(&self, record: EventRecord) {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        if records.len() >= RECORD_HISTORY {
            records.pop_front();
        }
        records.push_back(record);
    }
}

impl Default for LocalEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for LocalEventLog {
    fn commit(&self, event: &ThresholdEvent) -> Result<LogHandle, EventError> {
        let handle = LogHandle(Uuid::new_v4());
        error!(
            metric = %event.metric,
            event = %event.event,
            reading = event.reading,
            threshold = event.threshold,
            entry = %handle,
            "threshold event committed"
        );
        self.open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(handle.clone(), event.metric.clone());
        self.push_record(EventRecord::Committed(event.clone()));
        Ok(handle)
    }

    fn resolve(
        &self,
        handle: &LogHandle,
        metric: &str,
        reading: f64,
    ) -> Result<(), EventError> {
        let removed = self
            .open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(handle);
        if removed.is_none() {
            return Err(EventError::UnknownEntry {
                handle: handle.to_string(),
            });
        }
        info!(metric, reading, entry = %handle, "threshold event resolved");
        self.push_record(EventRecord::Resolved {
            metric: metric.to_string(),
            reading,
        });
        Ok(())
    }

    fn reading_normal(&self, metric: &str, reading: f64) -> Result<(), EventError> {
        info!(metric, reading, "reading back to normal");
        self.push_record(EventRecord::Normal {
            metric: metric.to_string(),
            reading,
        });
        Ok(())
    }
}
