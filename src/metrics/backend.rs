//! Collector seam between the orchestrator and whatever serves metrics.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::Result;

/// One observation of the pool fill-percentage metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Metric series name the value came from.
    pub metric: String,
    /// Reported fill percentage, nominally in `0..=100`.
    pub value: f64,
    /// When the sample was taken (collector-side clock).
    pub observed_at: DateTime<Utc>,
}

impl MetricSample {
    /// Sample stamped with the current time.
    #[must_use]
    pub fn now(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            observed_at: Utc::now(),
        }
    }
}

/// The set of alert ids firing at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSnapshot {
    firing: BTreeSet<String>,
}

impl AlertSnapshot {
    /// Snapshot from any iterable of alert ids.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            firing: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Snapshot with nothing firing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether `alert_id` is firing.
    #[must_use]
    pub fn contains(&self, alert_id: &str) -> bool {
        self.firing.contains(alert_id)
    }

    /// Number of firing alerts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.firing.len()
    }

    /// Whether nothing is firing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.firing.is_empty()
    }

    /// Firing ids in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.firing.iter().map(String::as_str)
    }

    /// Comma-joined rendering for error messages and logs.
    #[must_use]
    pub fn joined(&self) -> String {
        if self.firing.is_empty() {
            "none".to_string()
        } else {
            self.firing
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        }
    }
}

/// Read-side capability the orchestrator polls through.
///
/// Implementations perform exactly one query per call and never retry
/// internally; retry budgeting belongs to the poll loop. A failed or
/// unparseable query must surface as `MetricUnavailable` or
/// `AlertBackendUnreachable`, never as a default value.
pub trait MetricsCollector: Send + Sync {
    /// Fetch the current fill-percentage sample for `pool`.
    fn fetch_percent_metric(&self, pool: &str) -> Result<MetricSample>;

    /// Fetch the set of currently firing alerts.
    fn fetch_alerts(&self) -> Result<AlertSnapshot>;
}
