//! Prometheus text exposition parsing and series selection.

use std::collections::BTreeMap;

use regex::Regex;

use crate::core::errors::{CapError, Result};
use crate::metrics::backend::MetricSample;

/// Series reporting thin-pool data usage as a percentage of capacity.
pub const DEFAULT_METRIC_NAME: &str = "topolvm_thinpool_data_percent";

/// One decoded sample line.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    /// Metric series name.
    pub name: String,
    /// Label set, possibly empty.
    pub labels: BTreeMap<String, String>,
    /// Sample value.
    pub value: f64,
}

/// Line-oriented parser for the Prometheus text exposition format.
///
/// Covers the subset real exporters emit: optional label block, optional
/// trailing timestamp, backslash escapes inside label values. Comment and
/// malformed lines are skipped; absence of the wanted series is reported by
/// [`ExpositionParser::select_percent`], not here.
#[derive(Debug)]
pub struct ExpositionParser {
    line_re: Regex,
    label_re: Regex,
}

impl ExpositionParser {
    /// Compile the line grammar.
    pub fn new() -> Result<Self> {
        let line_re = Regex::new(
            r"^([a-zA-Z_:][a-zA-Z0-9_:]*)(?:\{([^}]*)\})?\s+(\S+)(?:\s+-?\d+)?\s*$",
        )
        .map_err(|error| CapError::runtime(format!("exposition line regex: {error}")))?;
        let label_re = Regex::new(r#"([a-zA-Z_][a-zA-Z0-9_]*)="((?:\\.|[^"\\])*)""#)
            .map_err(|error| CapError::runtime(format!("exposition label regex: {error}")))?;
        Ok(Self { line_re, label_re })
    }

    /// Decode every sample line in `text`.
    #[must_use]
    pub fn samples(&self, text: &str) -> Vec<RawSample> {
        let mut out = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(caps) = self.line_re.captures(line) else {
                continue;
            };
            let Ok(value) = caps[3].parse::<f64>() else {
                continue;
            };
            let labels = caps.get(2).map_or_else(BTreeMap::new, |block| {
                self.label_re
                    .captures_iter(block.as_str())
                    .map(|label| (label[1].to_string(), unescape_label(&label[2])))
                    .collect()
            });
            out.push(RawSample {
                name: caps[1].to_string(),
                labels,
                value,
            });
        }
        out
    }

    /// Pick the fill-percentage sample for `pool` out of an exposition body.
    ///
    /// A series matches when any of its label values equals the pool
    /// identifier. A single unlabeled series of the right name also matches
    /// (single-pool exporters). Everything else is `MetricUnavailable`.
    pub fn select_percent(
        &self,
        text: &str,
        metric_name: &str,
        pool: &str,
    ) -> Result<MetricSample> {
        let candidates: Vec<RawSample> = self
            .samples(text)
            .into_iter()
            .filter(|sample| sample.name == metric_name)
            .collect();

        if candidates.is_empty() {
            return Err(CapError::metric_unavailable(format!(
                "metric {metric_name} absent from exposition"
            )));
        }

        let matched = candidates
            .iter()
            .find(|sample| sample.labels.values().any(|value| value == pool))
            .or_else(|| match candidates.as_slice() {
                [only] if only.labels.is_empty() => Some(only),
                _ => None,
            })
            .ok_or_else(|| {
                CapError::metric_unavailable(format!(
                    "no {metric_name} series matches pool {pool:?} \
                     ({} series present)",
                    candidates.len()
                ))
            })?;

        if !matched.value.is_finite() {
            return Err(CapError::metric_unavailable(format!(
                "{metric_name} for pool {pool:?} is non-finite: {}",
                matched.value
            )));
        }

        Ok(MetricSample::now(metric_name, matched.value))
    }
}

fn unescape_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
