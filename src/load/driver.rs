//! Load driver contract and tuning knobs.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CapError, Result};

/// Offset ordering for fill writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IoPattern {
    /// Ascending offsets.
    #[default]
    Sequential,
    /// Block offsets visited in shuffled order.
    Random,
}

impl fmt::Display for IoPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Random => write!(f, "random"),
        }
    }
}

impl FromStr for IoPattern {
    type Err = CapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" | "seq" => Ok(Self::Sequential),
            "random" | "rand" => Ok(Self::Random),
            other => Err(CapError::invalid_config(format!(
                "unknown io pattern {other:?} (expected sequential or random)"
            ))),
        }
    }
}

/// Tuning for a fill run. Mirrors the knobs a synthetic-IO tool exposes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FillOptions {
    /// Bytes per write call.
    pub block_size_bytes: u64,
    /// Concurrent writer lanes.
    pub queue_depth: u32,
    /// Fraction of read operations mixed in per write, `0.0..1.0`.
    /// Read-backs are issued with `pread` and are a no-op off unix.
    pub read_write_ratio: f64,
    /// Throughput ceiling across all lanes. `None` means unthrottled.
    pub rate_limit_bytes_per_sec: Option<u64>,
    /// Offset ordering.
    pub io_pattern: IoPattern,
    /// Flush cadence while writing. `0` defers to the final flush.
    pub fsync_every_bytes: u64,
}

impl Default for FillOptions {
    fn default() -> Self {
        Self {
            block_size_bytes: 4 * 1024 * 1024,
            queue_depth: 4,
            read_write_ratio: 0.0,
            rate_limit_bytes_per_sec: None,
            io_pattern: IoPattern::Sequential,
            fsync_every_bytes: 64 * 1024 * 1024,
        }
    }
}

impl FillOptions {
    /// Reject combinations no driver can honor.
    pub fn validate(&self) -> Result<()> {
        if self.block_size_bytes == 0 {
            return Err(CapError::invalid_config("fill.block_size_bytes must be > 0"));
        }
        if self.queue_depth == 0 {
            return Err(CapError::invalid_config("fill.queue_depth must be > 0"));
        }
        if !self.read_write_ratio.is_finite()
            || self.read_write_ratio < 0.0
            || self.read_write_ratio >= 1.0
        {
            return Err(CapError::invalid_config(format!(
                "fill.read_write_ratio must be in [0.0, 1.0), got {}",
                self.read_write_ratio
            )));
        }
        if self.rate_limit_bytes_per_sec == Some(0) {
            return Err(CapError::invalid_config(
                "fill.rate_limit_bytes_per_sec must be > 0 when set",
            ));
        }
        Ok(())
    }
}

/// One fill order: add `target_bytes` of new data under `label`.
#[derive(Debug, Clone, PartialEq)]
pub struct FillRequest {
    /// Step label, also used to name the artifact.
    pub label: String,
    /// Bytes of new data to write for this step.
    pub target_bytes: u64,
    /// Tuning knobs.
    pub options: FillOptions,
}

/// What a completed fill actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillCompletion {
    /// Bytes durably written.
    pub bytes_written: u64,
    /// Wall time of the fill.
    pub duration: Duration,
}

/// Writes data into the pool under test.
///
/// On `Ok` the written bytes are durable (flushed to the backing store), so a
/// truthful fill-percentage metric must reflect them. Any `Err` is fatal for
/// the run; drivers do not retry.
pub trait LoadDriver: Send + Sync {
    /// Execute one fill order.
    fn fill(&self, request: &FillRequest) -> Result<FillCompletion>;
}
