//! CAP-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, CapError>;

/// Top-level error type for the capacity alert probe.
///
/// Only the two transient collector failures are retryable; every other
/// variant is fatal to the run it occurs in.
#[derive(Debug, Error)]
pub enum CapError {
    #[error("[CAP-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[CAP-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[CAP-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[CAP-1101] invalid fill plan: {details}")]
    InvalidPlan { details: String },

    #[error("[CAP-2001] load generation failed in step {step}: {details}")]
    LoadFailed { step: String, details: String },

    #[error("[CAP-3001] fill metric unavailable: {details}")]
    MetricUnavailable { details: String },

    #[error("[CAP-3002] alert backend unreachable: {details}")]
    AlertBackendUnreachable { details: String },

    #[error("[CAP-3101] no usable observation for step {step} after {attempts} attempts: {details}")]
    Staleness {
        step: String,
        attempts: u32,
        details: String,
    },

    #[error(
        "[CAP-4001] occupancy outside tolerance in step {step}: \
         expected {expected_bytes} B, reported {actual_bytes} B, \
         |delta| {delta_bytes} B exceeds tolerance {tolerance_bytes} B"
    )]
    ToleranceExceeded {
        step: String,
        expected_bytes: u64,
        actual_bytes: u64,
        delta_bytes: u64,
        tolerance_bytes: u64,
    },

    #[error("[CAP-4002] alert state mismatch in step {step}: expected {expected}, firing [{firing}]")]
    AlertStateMismatch {
        step: String,
        expected: String,
        firing: String,
    },

    #[error("[CAP-5001] run cancelled during step {step}")]
    Cancelled { step: String },

    #[error("[CAP-6001] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[CAP-6002] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[cfg(feature = "sqlite")]
    #[error("[CAP-6003] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[CAP-6004] runtime failure: {details}")]
    Runtime { details: String },
}

impl CapError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "CAP-1001",
            Self::MissingConfig { .. } => "CAP-1002",
            Self::ConfigParse { .. } => "CAP-1003",
            Self::InvalidPlan { .. } => "CAP-1101",
            Self::LoadFailed { .. } => "CAP-2001",
            Self::MetricUnavailable { .. } => "CAP-3001",
            Self::AlertBackendUnreachable { .. } => "CAP-3002",
            Self::Staleness { .. } => "CAP-3101",
            Self::ToleranceExceeded { .. } => "CAP-4001",
            Self::AlertStateMismatch { .. } => "CAP-4002",
            Self::Cancelled { .. } => "CAP-5001",
            Self::Io { .. } => "CAP-6001",
            Self::Serialization { .. } => "CAP-6002",
            #[cfg(feature = "sqlite")]
            Self::Sql { .. } => "CAP-6003",
            Self::Runtime { .. } => "CAP-6004",
        }
    }

    /// Whether the poll loop may retry after this failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MetricUnavailable { .. } | Self::AlertBackendUnreachable { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for configuration validation failures.
    #[must_use]
    pub fn invalid_config(details: impl Into<String>) -> Self {
        Self::InvalidConfig {
            details: details.into(),
        }
    }

    /// Convenience constructor for plan validation failures.
    #[must_use]
    pub fn invalid_plan(details: impl Into<String>) -> Self {
        Self::InvalidPlan {
            details: details.into(),
        }
    }

    /// Convenience constructor for load driver failures.
    #[must_use]
    pub fn load_failed(step: impl Into<String>, details: impl Into<String>) -> Self {
        Self::LoadFailed {
            step: step.into(),
            details: details.into(),
        }
    }

    /// Convenience constructor for transient metric fetch failures.
    #[must_use]
    pub fn metric_unavailable(details: impl Into<String>) -> Self {
        Self::MetricUnavailable {
            details: details.into(),
        }
    }

    /// Convenience constructor for transient alert backend failures.
    #[must_use]
    pub fn alert_backend(details: impl Into<String>) -> Self {
        Self::AlertBackendUnreachable {
            details: details.into(),
        }
    }

    /// Convenience constructor for runtime failures.
    #[must_use]
    pub fn runtime(details: impl Into<String>) -> Self {
        Self::Runtime {
            details: details.into(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for CapError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for CapError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for CapError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
