//! Error handling for the BMC health monitoring daemon
//!
//! This module provides error types for all daemon operations, including
//! configuration loading, raw sample collection, property-bus publication,
//! and event-log lifecycle management.

use std::io;

use thiserror::Error;

/// The main error type for the health daemon
#[derive(Error, Debug)]
pub enum HealthError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Raw sampler related errors
    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    /// Property bus related errors
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Event log related errors
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// Platform call errors (unit activation, inventory lookup)
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Telemetry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors
    #[error("{0}")]
    Generic(String),
}

/// Configuration specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to parse configuration file {path}: {reason}")]
    ParseFailed { path: String, reason: String },

    #[error("Metric {metric} threshold {key} has a non-finite value")]
    NonFiniteThreshold { metric: String, key: String },

    #[error("Metric {metric} has invalid window size {value} (must be >= 1)")]
    InvalidWindowSize { metric: String, value: usize },

    #[error("Metric {metric} has invalid hysteresis {value} (must be finite and >= 0)")]
    InvalidHysteresis { metric: String, value: f64 },

    #[error("Invalid daemon setting: {reason}")]
    InvalidSetting { reason: String },
}

/// Raw sampler errors
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Unable to read {path}: {reason}")]
    SourceUnreadable { path: String, reason: String },

    #[error("CPU accounting line in {path} is missing the cpu label")]
    MissingCpuLabel { path: String },

    #[error("CPU accounting line in {path} has {count} fields, expected {expected}")]
    TruncatedCpuLine {
        path: String,
        count: usize,
        expected: usize,
    },

    #[error("Memory info in {path} is missing the {key} entry")]
    MissingMemoryKey { path: String, key: &'static str },
}

/// Property bus errors
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Object already registered: {path}")]
    DuplicateObject { path: String },

    #[error("No such object: {path}")]
    UnknownObject { path: String },
}

/// Event log errors
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Failed to commit event for {metric}: {reason}")]
    CommitFailed { metric: String, reason: String },

    #[error("No open event log entry for handle {handle}")]
    UnknownEntry { handle: String },
}

/// Platform call errors
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to start unit {unit}: {reason}")]
    UnitStartFailed { unit: String, reason: String },
}

/// Telemetry errors
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metric registration failed: {name}")]
    RegistrationFailed { name: String },

    #[error("Metrics export failed: {reason}")]
    ExportFailed { reason: String },

    #[error("Metrics server failed: {reason}")]
    ServerFailed { reason: String },
}

/// Result type alias for the health daemon
pub type Result<T> = std::result::Result<T, HealthError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for sampler operations
pub type SamplerResult<T> = std::result::Result<T, SamplerError>;

/// Result type alias for telemetry operations
pub type MetricsResult<T> = std::result::Result<T, MetricsError>;

impl From<String> for HealthError {
    fn from(s: String) -> Self {
        HealthError::Generic(s)
    }
}

impl From<&str> for HealthError {
    fn from(s: &str) -> Self {
        HealthError::Generic(s.to_string())
    }
}
