//! Run and step reports: the machine-readable verdict of a validation run.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CapError, Result};

/// Verdict for one fill step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Passed,
    Failed,
}

/// Verdict for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Passed,
    Failed,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Everything observed while verifying one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Step label from the plan.
    pub label: String,
    /// Cumulative target fraction for this step.
    pub target_fraction: f64,
    /// Model-derived expected occupancy after this step.
    pub expected_bytes: u64,
    /// New bytes the driver wrote for this step.
    pub fill_delta_bytes: u64,
    /// Last fill-percentage reading, when one was obtained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_percent: Option<f64>,
    /// Reported minus expected bytes, when a reading was obtained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_bytes: Option<i64>,
    /// Observation attempts spent on this step.
    pub attempts: u32,
    /// Known threshold alerts firing at the final observation.
    pub alerts_firing: Vec<String>,
    /// Alert the plan expected, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_alert: Option<String>,
    /// Step verdict.
    pub outcome: StepOutcome,
    /// Failure description, for failed steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time spent on the step, fill included.
    pub duration_ms: u64,
}

/// Full record of one validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// RFC 3339 start stamp.
    pub started_at: String,
    /// RFC 3339 finish stamp (or the stamp of the partial snapshot).
    pub finished_at: String,
    /// Pool under test.
    pub pool: String,
    /// Pool capacity the expectations were derived from.
    pub capacity_bytes: u64,
    /// Tolerance band applied to every comparison.
    pub tolerance_bytes: u64,
    /// Run verdict.
    pub outcome: RunOutcome,
    /// Stable error code of the failure, for failed runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable failure, for failed runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Per-step records, in plan order, up to the halt point.
    pub steps: Vec<StepReport>,
}

impl RunReport {
    /// One-line verdict for logs and terminals.
    #[must_use]
    pub fn summary_line(&self) -> String {
        let passed = self
            .steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Passed)
            .count();
        match self.outcome {
            RunOutcome::Passed => format!(
                "PASS pool {} ({passed}/{} steps within tolerance)",
                self.pool,
                self.steps.len()
            ),
            RunOutcome::Failed => {
                let code = self.error_code.as_deref().unwrap_or("CAP-6004");
                let message = self.error_message.as_deref().unwrap_or("unknown failure");
                format!(
                    "FAIL pool {} after {passed} passed step(s) [{code}]: {message}",
                    self.pool
                )
            }
        }
    }

    /// Write the report as JSON, atomically (temp file + rename).
    pub fn write_json(&self, path: &Path, pretty: bool) -> Result<()> {
        let mut body = if pretty {
            serde_json::to_vec_pretty(self)?
        } else {
            serde_json::to_vec(self)?
        };
        body.push(b'\n');

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| CapError::io(parent, e))?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &body).map_err(|e| CapError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| CapError::io(path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn passed_step(label: &str) -> StepReport {
        StepReport {
            label: label.to_string(),
            target_fraction: 0.7,
            expected_bytes: 70,
            fill_delta_bytes: 70,
            reported_percent: Some(69.5),
            delta_bytes: Some(-1),
            attempts: 1,
            alerts_firing: Vec::new(),
            expected_alert: None,
            outcome: StepOutcome::Passed,
            error: None,
            duration_ms: 12,
        }
    }

    fn report(outcome: RunOutcome) -> RunReport {
        RunReport {
            started_at: "2026-08-22T10:00:00.000Z".to_string(),
            finished_at: "2026-08-22T10:05:00.000Z".to_string(),
            pool: "thin-pool-1".to_string(),
            capacity_bytes: 100,
            tolerance_bytes: 2,
            outcome,
            error_code: None,
            error_message: None,
            steps: vec![passed_step("fill-to-70")],
        }
    }

    #[test]
    fn pass_summary_counts_steps() {
        let r = report(RunOutcome::Passed);
        assert_eq!(
            r.summary_line(),
            "PASS pool thin-pool-1 (1/1 steps within tolerance)"
        );
    }

    #[test]
    fn fail_summary_carries_code_and_message() {
        let mut r = report(RunOutcome::Failed);
        r.error_code = Some("CAP-4001".to_string());
        r.error_message = Some("off by 19 GiB".to_string());
        let line = r.summary_line();
        assert!(line.starts_with("FAIL pool thin-pool-1"));
        assert!(line.contains("CAP-4001"));
        assert!(line.contains("off by 19 GiB"));
    }

    #[test]
    fn json_round_trips_and_omits_empty_options() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        let r = report(RunOutcome::Passed);
        r.write_json(&path, true).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("error_code"));
        let back: RunReport = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, r);
        assert!(!dir.path().join("report.json.tmp").exists());
    }
}
