//! The fill sequence state machine.
//!
//! Walks the plan in order: fill, settle, poll until the metric and alert
//! state match expectations, then move on. The first verdict failure halts
//! the run; only transient observation failures are retried.

use std::fmt;
use std::time::{Duration, Instant};

use crate::core::errors::{CapError, Result};
use crate::load::driver::{FillOptions, FillRequest, LoadDriver};
use crate::logger::activity::{ActivityLoggerHandle, ProbeEvent};
use crate::logger::jsonl::format_utc_now;
use crate::metrics::alerts::AlertEvaluator;
use crate::metrics::backend::MetricsCollector;
use crate::metrics::comparator::CapacityComparator;
use crate::model::occupancy::{DEFAULT_TOLERANCE_PERCENT, OccupancyModel, ToleranceSpec};
use crate::model::plan::{FillPlan, FillStep};
use crate::model::pool::ThinPool;
use crate::probe::cancel::CancelToken;
use crate::probe::poll::PollPolicy;
use crate::probe::report::{RunOutcome, RunReport, StepOutcome, StepReport};

/// Where the orchestrator currently is. Step indexes are zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    /// Not started.
    Idle,
    /// Driving load for a step.
    Filling(usize),
    /// Waiting for the observed state of a step to match.
    Polling(usize),
    /// Step verified; about to advance.
    Asserted(usize),
    /// Every step verified.
    Complete,
}

impl fmt::Display for ProbePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Filling(i) => write!(f, "filling({i})"),
            Self::Polling(i) => write!(f, "polling({i})"),
            Self::Asserted(i) => write!(f, "asserted({i})"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Runs a fill plan against a pool and verifies what the monitoring stack
/// reports after every step.
///
/// The borrowed driver and collector are the only seams to the outside
/// world, so the whole sequence runs identically against a real pool or the
/// simulation.
pub struct FillSequenceOrchestrator<'a> {
    model: OccupancyModel,
    plan: FillPlan,
    driver: &'a dyn LoadDriver,
    collector: &'a dyn MetricsCollector,
    evaluator: AlertEvaluator,
    policy: PollPolicy,
    settle_delay: Duration,
    fill_options: FillOptions,
    pool_name: String,
    cancel: CancelToken,
    activity: Option<ActivityLoggerHandle>,
    phase: ProbePhase,
    steps: Vec<StepReport>,
    started_at: Option<String>,
    finished_at: Option<String>,
    last_error: Option<(String, String)>,
}

impl fmt::Debug for FillSequenceOrchestrator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FillSequenceOrchestrator")
            .field("pool_name", &self.pool_name)
            .field("phase", &self.phase)
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl<'a> FillSequenceOrchestrator<'a> {
    /// Wire up a run. Fails when the plan expects an alert the evaluator
    /// does not know, which would make the run unfalsifiable.
    pub fn new(
        pool: &ThinPool,
        plan: FillPlan,
        tolerance: ToleranceSpec,
        driver: &'a dyn LoadDriver,
        collector: &'a dyn MetricsCollector,
        evaluator: AlertEvaluator,
    ) -> Result<Self> {
        for step in plan.steps() {
            if let Some(alert) = &step.expected_alert {
                if !evaluator.is_known(alert) {
                    return Err(CapError::invalid_plan(format!(
                        "step {} expects alert {alert:?} missing from the threshold registry",
                        step.label
                    )));
                }
            }
        }
        Ok(Self {
            model: OccupancyModel::new(pool, tolerance)?,
            plan,
            driver,
            collector,
            evaluator,
            policy: PollPolicy::default(),
            settle_delay: Duration::ZERO,
            fill_options: FillOptions::default(),
            pool_name: pool.name().to_string(),
            cancel: CancelToken::new(),
            activity: None,
            phase: ProbePhase::Idle,
            steps: Vec::new(),
            started_at: None,
            finished_at: None,
            last_error: None,
        })
    }

    /// Replace the retry budget.
    #[must_use]
    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Wait this long after every fill before the first observation.
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Tuning for the driver's fills.
    #[must_use]
    pub fn with_fill_options(mut self, options: FillOptions) -> Self {
        self.fill_options = options;
        self
    }

    /// Observe this token at every suspension point.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Stream events to an activity logger.
    #[must_use]
    pub fn with_activity(mut self, handle: ActivityLoggerHandle) -> Self {
        self.activity = Some(handle);
        self
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> ProbePhase {
        self.phase
    }

    /// Execute the whole plan. Halts at the first failure.
    ///
    /// On `Err` the partial record stays available through [`Self::report`].
    pub fn run(&mut self) -> Result<RunReport> {
        self.policy.validate()?;
        self.fill_options.validate()?;

        self.steps.clear();
        self.last_error = None;
        self.phase = ProbePhase::Idle;
        self.started_at = Some(format_utc_now());
        let run_started = Instant::now();
        self.emit(ProbeEvent::RunStarted {
            pool: self.pool_name.clone(),
            capacity_bytes: self.model.capacity_bytes(),
            steps: self.plan.len(),
        });

        let result = self.execute();
        self.finished_at = Some(format_utc_now());

        match result {
            Ok(()) => {
                self.phase = ProbePhase::Complete;
                self.emit(ProbeEvent::RunCompleted {
                    pool: self.pool_name.clone(),
                    duration_ms: millis(run_started.elapsed()),
                });
                Ok(self.report())
            }
            Err(e) => {
                self.last_error = Some((e.code().to_string(), e.to_string()));
                self.emit(ProbeEvent::RunFailed {
                    pool: self.pool_name.clone(),
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Snapshot of the run so far. Safe to call after a failed `run`.
    #[must_use]
    pub fn report(&self) -> RunReport {
        let outcome = if self.last_error.is_none() && self.phase == ProbePhase::Complete {
            RunOutcome::Passed
        } else {
            RunOutcome::Failed
        };
        RunReport {
            started_at: self.started_at.clone().unwrap_or_else(format_utc_now),
            finished_at: self.finished_at.clone().unwrap_or_else(format_utc_now),
            pool: self.pool_name.clone(),
            capacity_bytes: self.model.capacity_bytes(),
            tolerance_bytes: self.model.tolerance_bytes(),
            outcome,
            error_code: self.last_error.as_ref().map(|(code, _)| code.clone()),
            error_message: self.last_error.as_ref().map(|(_, msg)| msg.clone()),
            steps: self.steps.clone(),
        }
    }

    fn execute(&mut self) -> Result<()> {
        let steps = self.plan.steps().to_vec();
        let mut prev_expected = 0u64;
        for (idx, step) in steps.iter().enumerate() {
            self.run_step(idx, step, prev_expected)?;
            prev_expected = self.model.expected_occupied_bytes(step);
        }
        Ok(())
    }

    /// One step: fill the delta, settle, then poll to a verdict. The step
    /// record is pushed whether the step passed or failed.
    fn run_step(&mut self, idx: usize, step: &FillStep, prev_expected: u64) -> Result<()> {
        let expected = self.model.expected_occupied_bytes(step);
        let delta = expected.saturating_sub(prev_expected);
        let step_started = Instant::now();

        let mut attempts = 0u32;
        let mut last_percent = None;
        let mut last_delta = None;
        let mut alerts_firing = Vec::new();

        let result = self.drive_step(
            idx,
            step,
            expected,
            delta,
            &mut attempts,
            &mut last_percent,
            &mut last_delta,
            &mut alerts_firing,
        );

        let (outcome, error) = match &result {
            Ok(()) => (StepOutcome::Passed, None),
            Err(e) => (StepOutcome::Failed, Some(e.to_string())),
        };
        self.steps.push(StepReport {
            label: step.label.clone(),
            target_fraction: step.target_fraction,
            expected_bytes: expected,
            fill_delta_bytes: delta,
            reported_percent: last_percent,
            delta_bytes: last_delta,
            attempts,
            alerts_firing: alerts_firing.clone(),
            expected_alert: step.expected_alert.clone(),
            outcome,
            error,
            duration_ms: millis(step_started.elapsed()),
        });

        match &result {
            Ok(()) => self.emit(ProbeEvent::StepPassed {
                step: step.label.clone(),
                attempts,
            }),
            Err(e) => self.emit(ProbeEvent::StepFailed {
                step: step.label.clone(),
                code: e.code().to_string(),
                message: e.to_string(),
            }),
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn drive_step(
        &mut self,
        idx: usize,
        step: &FillStep,
        expected: u64,
        delta: u64,
        attempts: &mut u32,
        last_percent: &mut Option<f64>,
        last_delta: &mut Option<i64>,
        alerts_firing: &mut Vec<String>,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CapError::Cancelled {
                step: step.label.clone(),
            });
        }

        self.phase = ProbePhase::Filling(idx);
        self.emit(ProbeEvent::FillStarted {
            step: step.label.clone(),
            target_bytes: delta,
        });
        let completion = self
            .driver
            .fill(&FillRequest {
                label: step.label.clone(),
                target_bytes: delta,
                options: self.fill_options,
            })
            .map_err(|e| match e {
                load @ CapError::LoadFailed { .. } => load,
                other => CapError::load_failed(&step.label, other.to_string()),
            })?;
        self.emit(ProbeEvent::FillCompleted {
            step: step.label.clone(),
            bytes_written: completion.bytes_written,
            duration_ms: millis(completion.duration),
        });

        if !self.settle_delay.is_zero() {
            self.emit(ProbeEvent::SettleStarted {
                step: step.label.clone(),
                delay_secs: self.settle_delay.as_secs(),
            });
            if !self.cancel.sleep(self.settle_delay) {
                return Err(CapError::Cancelled {
                    step: step.label.clone(),
                });
            }
        }

        self.phase = ProbePhase::Polling(idx);
        let poll_started = Instant::now();
        let mut last_transient: Option<CapError> = None;

        for attempt in 1..=self.policy.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(CapError::Cancelled {
                    step: step.label.clone(),
                });
            }
            *attempts = attempt;
            self.emit(ProbeEvent::PollAttempt {
                step: step.label.clone(),
                attempt,
            });

            match self.observe(step, expected, last_percent, last_delta, alerts_firing) {
                Ok(()) => {
                    self.phase = ProbePhase::Asserted(idx);
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    last_transient = Some(e);
                    if attempt == self.policy.max_attempts {
                        break;
                    }
                    let pause = self.policy.backoff_for(attempt);
                    if poll_started.elapsed() + pause >= self.policy.max_elapsed {
                        break;
                    }
                    if !self.cancel.sleep(pause) {
                        return Err(CapError::Cancelled {
                            step: step.label.clone(),
                        });
                    }
                }
                Err(fatal) => return Err(fatal),
            }
        }

        Err(CapError::Staleness {
            step: step.label.clone(),
            attempts: *attempts,
            details: last_transient
                .map_or_else(|| "no observation attempted".to_string(), |e| e.to_string()),
        })
    }

    /// One observation: metric first, tolerance verdict, then alert state.
    /// A tolerance failure never reaches the alert backend.
    fn observe(
        &mut self,
        step: &FillStep,
        expected: u64,
        last_percent: &mut Option<f64>,
        last_delta: &mut Option<i64>,
        alerts_firing: &mut Vec<String>,
    ) -> Result<()> {
        let sample = self.collector.fetch_percent_metric(&self.pool_name)?;
        let comparison = CapacityComparator::new(self.model.capacity_bytes()).compare(
            expected,
            &sample,
            self.model.tolerance_bytes(),
        );
        *last_percent = Some(comparison.reported_percent);
        *last_delta = Some(comparison.delta_bytes);
        self.emit(ProbeEvent::MetricObserved {
            step: step.label.clone(),
            reported_percent: comparison.reported_percent,
            expected_bytes: comparison.expected_bytes,
            actual_bytes: comparison.actual_bytes,
            delta_bytes: comparison.delta_bytes,
        });

        if !comparison.within_tolerance {
            return Err(CapError::ToleranceExceeded {
                step: step.label.clone(),
                expected_bytes: comparison.expected_bytes,
                actual_bytes: comparison.actual_bytes,
                delta_bytes: comparison.abs_delta_bytes(),
                tolerance_bytes: self.model.tolerance_bytes(),
            });
        }

        let snapshot = self.collector.fetch_alerts()?;
        let known = self.evaluator.known_firing(&snapshot);
        alerts_firing.clone_from(&known);
        self.emit(ProbeEvent::AlertsObserved {
            step: step.label.clone(),
            alerts: known.clone(),
        });

        if !self
            .evaluator
            .expectation_met(step.expected_alert.as_deref(), &snapshot)
        {
            let expected_alert = step
                .expected_alert
                .clone()
                .unwrap_or_else(|| "none".to_string());
            let firing = if known.is_empty() {
                "none".to_string()
            } else {
                known.join(", ")
            };
            return Err(CapError::AlertStateMismatch {
                step: step.label.clone(),
                expected: expected_alert,
                firing,
            });
        }

        Ok(())
    }

    fn emit(&self, event: ProbeEvent) {
        if let Some(handle) = &self.activity {
            handle.send(event);
        }
    }
}

/// Validate a pool's capacity alerting in one call.
///
/// Builds the plan, runs it with default tolerance, polling and fill
/// options, no settle delay and the default threshold registry. Callers
/// needing more control use [`FillSequenceOrchestrator`] directly.
pub fn validate_capacity_sequence(
    pool: &ThinPool,
    steps: Vec<FillStep>,
    driver: &dyn LoadDriver,
    collector: &dyn MetricsCollector,
) -> Result<RunReport> {
    let plan = FillPlan::new(steps)?;
    let mut orchestrator = FillSequenceOrchestrator::new(
        pool,
        plan,
        ToleranceSpec::CapacityPercent(DEFAULT_TOLERANCE_PERCENT),
        driver,
        collector,
        AlertEvaluator::default(),
    )?;
    orchestrator.run()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ──────────────────── tests ────────────────────
