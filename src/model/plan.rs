//! Ordered fill plans with structural validation.

use serde::{Deserialize, Serialize};

use crate::core::errors::{CapError, Result};

/// One stage of a fill sequence.
///
/// `target_fraction` is the cumulative pool occupancy this step drives the
/// pool to, not the increment written during the step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillStep {
    /// Label used in reports, logs and error messages.
    pub label: String,
    /// Cumulative occupancy target in `(0, 1]`.
    pub target_fraction: f64,
    /// Alert id that must be firing once this step settles; `None` means no
    /// known threshold alert may be firing.
    pub expected_alert: Option<String>,
}

impl FillStep {
    /// Shorthand constructor.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        target_fraction: f64,
        expected_alert: Option<&str>,
    ) -> Self {
        Self {
            label: label.into(),
            target_fraction,
            expected_alert: expected_alert.map(str::to_string),
        }
    }
}

/// A validated, ordered sequence of fill steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillPlan {
    steps: Vec<FillStep>,
}

impl FillPlan {
    /// Validate and seal a step sequence.
    ///
    /// Rejected shapes: an empty plan, fractions outside `(0, 1]`, fractions
    /// that do not strictly increase, duplicate or blank labels, and a step
    /// expecting no alert after an earlier step expected one (threshold
    /// alerts latch while occupancy only grows, so that expectation can
    /// never hold).
    pub fn new(steps: Vec<FillStep>) -> Result<Self> {
        if steps.is_empty() {
            return Err(CapError::invalid_plan("plan must contain at least one step"));
        }

        let mut previous_fraction = 0.0_f64;
        let mut alert_seen = false;
        let mut labels: Vec<&str> = Vec::with_capacity(steps.len());

        for step in &steps {
            if step.label.trim().is_empty() {
                return Err(CapError::invalid_plan("step labels must not be blank"));
            }
            if labels.contains(&step.label.as_str()) {
                return Err(CapError::invalid_plan(format!(
                    "duplicate step label {:?}",
                    step.label
                )));
            }
            labels.push(&step.label);

            if !step.target_fraction.is_finite()
                || step.target_fraction <= 0.0
                || step.target_fraction > 1.0
            {
                return Err(CapError::invalid_plan(format!(
                    "step {:?} target fraction must be in (0, 1]; got {}",
                    step.label, step.target_fraction
                )));
            }
            if step.target_fraction <= previous_fraction {
                return Err(CapError::invalid_plan(format!(
                    "step {:?} target fraction {} does not increase past {}",
                    step.label, step.target_fraction, previous_fraction
                )));
            }
            previous_fraction = step.target_fraction;

            match &step.expected_alert {
                Some(id) if id.trim().is_empty() => {
                    return Err(CapError::invalid_plan(format!(
                        "step {:?} expected alert id must not be blank",
                        step.label
                    )));
                }
                Some(_) => alert_seen = true,
                None if alert_seen => {
                    return Err(CapError::invalid_plan(format!(
                        "step {:?} expects no alert after an earlier step expected one",
                        step.label
                    )));
                }
                None => {}
            }
        }

        Ok(Self { steps })
    }

    /// The reference sequence from the thin-pool alert test this probe
    /// automates: 70% silent, 77% across the 75% threshold, 87% across 85%.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            steps: vec![
                FillStep::new("fill-to-70", 0.70, None),
                FillStep::new("fill-to-77", 0.77, Some("tp_data_75_percent")),
                FillStep::new("fill-to-87", 0.87, Some("tp_data_85_percent")),
            ],
        }
    }

    /// Steps in execution order.
    #[must_use]
    pub fn steps(&self) -> &[FillStep] {
        &self.steps
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false for a constructed plan; present for API completeness.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Alert ids referenced by any step.
    pub fn expected_alert_ids(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .filter_map(|step| step.expected_alert.as_deref())
    }
}
