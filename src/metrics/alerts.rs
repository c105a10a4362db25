//! Threshold alert registry, expectation evaluation, payload decoding.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;

use crate::core::errors::{CapError, Result};
use crate::metrics::backend::AlertSnapshot;

/// Alert raised when thin-pool data usage crosses 75%.
pub const TP_DATA_75_PERCENT: &str = "tp_data_75_percent";

/// Alert raised when thin-pool data usage crosses 85%.
pub const TP_DATA_85_PERCENT: &str = "tp_data_85_percent";

/// Decides whether an alert snapshot satisfies a step expectation.
///
/// Holds the registry of known threshold alert ids. Ids outside the registry
/// are somebody else's alerts and never influence a verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvaluator {
    known: BTreeSet<String>,
}

impl Default for AlertEvaluator {
    fn default() -> Self {
        Self::new([TP_DATA_75_PERCENT, TP_DATA_85_PERCENT])
    }
}

impl AlertEvaluator {
    /// Evaluator over an explicit registry of known threshold alert ids.
    pub fn new<I, S>(known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: known.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluator from a threshold map (id to firing percent), as configured.
    #[must_use]
    pub fn from_thresholds(thresholds: &BTreeMap<String, f64>) -> Self {
        Self::new(thresholds.keys().cloned())
    }

    /// Whether `alert_id` is firing in `snapshot`.
    #[must_use]
    pub fn is_firing(&self, alert_id: &str, snapshot: &AlertSnapshot) -> bool {
        snapshot.contains(alert_id)
    }

    /// Whether the registry knows `alert_id`.
    #[must_use]
    pub fn is_known(&self, alert_id: &str) -> bool {
        self.known.contains(alert_id)
    }

    /// Evaluate a step expectation against a snapshot.
    ///
    /// `Some(id)` requires `id` to be firing. `None` requires that no known
    /// threshold alert is firing; anything firing outside the registry is
    /// ignored either way.
    #[must_use]
    pub fn expectation_met(&self, expected: Option<&str>, snapshot: &AlertSnapshot) -> bool {
        match expected {
            Some(alert_id) => self.is_firing(alert_id, snapshot),
            None => !snapshot.iter().any(|id| self.known.contains(id)),
        }
    }

    /// Known threshold alerts present in `snapshot`, for diagnostics.
    #[must_use]
    pub fn known_firing(&self, snapshot: &AlertSnapshot) -> Vec<String> {
        snapshot
            .iter()
            .filter(|id| self.known.contains(*id))
            .map(str::to_string)
            .collect()
    }

    /// Registered ids in sorted order.
    pub fn known_ids(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AlertPayload {
    Names(Vec<String>),
    Prometheus { data: AlertData },
}

#[derive(Debug, Deserialize)]
struct AlertData {
    alerts: Vec<AlertEntry>,
}

#[derive(Debug, Deserialize)]
struct AlertEntry {
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    state: Option<String>,
}

/// Decode an alert backend response into a snapshot.
///
/// Accepts either a bare JSON array of alert names or a Prometheus-style
/// `{"data":{"alerts":[...]}}` body where only `firing` entries count.
/// Anything undecodable is `AlertBackendUnreachable`; an empty snapshot is
/// only ever produced from a well-formed empty response.
pub fn parse_alert_payload(raw: &str) -> Result<AlertSnapshot> {
    let payload: AlertPayload = serde_json::from_str(raw).map_err(|error| {
        CapError::alert_backend(format!("undecodable alert payload: {error}"))
    })?;

    let names = match payload {
        AlertPayload::Names(names) => names,
        AlertPayload::Prometheus { data } => data
            .alerts
            .into_iter()
            .filter(|entry| {
                entry
                    .state
                    .as_deref()
                    .is_none_or(|state| state.eq_ignore_ascii_case("firing"))
            })
            .filter_map(|entry| entry.labels.get("alertname").cloned())
            .collect(),
    };

    Ok(AlertSnapshot::new(names))
}
