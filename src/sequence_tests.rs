//! Property-based tests for sequence-level invariants.
//!
//! Uses `proptest` to verify that arbitrary fill plans and pool shapes
//! maintain the core guarantees: expected bytes grow with the plan, the
//! comparator's verdict agrees with its own delta fields, backoff stays
//! inside its cap, and an honest pool passes any plan below the first
//! alert threshold.

use std::collections::BTreeSet;
use std::time::Duration;

use proptest::prelude::*;

use crate::metrics::backend::MetricSample;
use crate::metrics::comparator::CapacityComparator;
use crate::model::occupancy::{DEFAULT_TOLERANCE_PERCENT, OccupancyModel, ToleranceSpec};
use crate::model::plan::{FillPlan, FillStep};
use crate::model::pool::ThinPool;
use crate::probe::orchestrator::validate_capacity_sequence;
use crate::probe::poll::PollPolicy;
use crate::probe::report::{RunOutcome, StepOutcome};
use crate::sim::SimulatedPool;

// ──────────────────── strategies ────────────────────

fn arb_capacity() -> impl Strategy<Value = u64> {
    1_000_000u64..100_000_000_000
}

/// Distinct integer percents, naturally ascending via the set ordering.
fn arb_percents(max: u32, count: usize) -> impl Strategy<Value = BTreeSet<u32>> {
    prop::collection::btree_set(1u32..=max, 1..count)
}

fn steps_from_percents(percents: &BTreeSet<u32>) -> Vec<FillStep> {
    percents
        .iter()
        .map(|pct| FillStep::new(format!("step-{pct}"), f64::from(*pct) / 100.0, None))
        .collect()
}

fn model_for(capacity: u64) -> OccupancyModel {
    let pool = ThinPool::new("prop-pool", capacity).unwrap();
    OccupancyModel::new(&pool, ToleranceSpec::CapacityPercent(DEFAULT_TOLERANCE_PERCENT)).unwrap()
}

// ──────────────────── property tests ────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Expected occupancy never decreases along a plan and never exceeds
    /// the pool's capacity.
    #[test]
    fn expected_bytes_monotone_in_fraction(
        capacity in arb_capacity(),
        percents in arb_percents(100, 8)
    ) {
        let model = model_for(capacity);
        let steps = steps_from_percents(&percents);

        let mut previous = 0u64;
        for step in &steps {
            let expected = model.expected_occupied_bytes(step);
            prop_assert!(
                expected >= previous,
                "expected bytes went backwards: {expected} < {previous}"
            );
            prop_assert!(expected <= capacity, "{expected} exceeds capacity {capacity}");
            previous = expected;
        }
    }

    /// The model's byte target stays within one byte of the exact
    /// `capacity * percent / 100` value.
    #[test]
    fn expected_bytes_track_the_fraction(
        capacity in arb_capacity(),
        pct in 1u32..=100
    ) {
        let model = model_for(capacity);
        let step = FillStep::new("probe", f64::from(pct) / 100.0, None);
        let expected = model.expected_occupied_bytes(&step);

        let exact = u128::from(capacity) * u128::from(pct) / 100;
        let truncated = u64::try_from(exact).unwrap();
        let diff = expected.abs_diff(truncated);
        prop_assert!(diff <= 1, "rounding drift {diff} for {capacity} at {pct}%");
    }

    /// The comparator's verdict always agrees with the delta it reports.
    #[test]
    fn comparator_verdict_matches_its_delta(
        capacity in arb_capacity(),
        expected_pct in 1u32..=99,
        reported_pct in 0.0f64..100.0,
        tolerance_pct in 1u32..=10
    ) {
        let model = model_for(capacity);
        let step = FillStep::new("probe", f64::from(expected_pct) / 100.0, None);
        let expected = model.expected_occupied_bytes(&step);
        let tolerance = u64::from(tolerance_pct) * capacity / 100;

        let comparator = CapacityComparator::new(capacity);
        let sample = MetricSample::now("topolvm_thinpool_data_percent", reported_pct);
        let outcome = comparator.compare(expected, &sample, tolerance);

        prop_assert_eq!(
            outcome.within_tolerance,
            outcome.abs_delta_bytes() <= tolerance
        );
        #[allow(clippy::cast_possible_wrap)]
        let recomputed = outcome.actual_bytes as i64 - outcome.expected_bytes as i64;
        prop_assert_eq!(outcome.delta_bytes, recomputed);
    }

    /// Deterministic backoff grows monotonically and never exceeds its cap.
    #[test]
    fn backoff_is_monotone_and_capped(
        initial_ms in 1u64..5_000,
        multiplier in 1.0f64..4.0,
        cap_factor in 1u64..100
    ) {
        let policy = PollPolicy {
            max_attempts: 20,
            initial_backoff: Duration::from_millis(initial_ms),
            backoff_multiplier: multiplier,
            max_backoff: Duration::from_millis(initial_ms * cap_factor),
            jitter_fraction: 0.0,
            max_elapsed: Duration::from_secs(600),
        };
        policy.validate().unwrap();

        let ceiling = policy.max_backoff + Duration::from_nanos(1);
        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let pause = policy.backoff_for(attempt);
            prop_assert!(pause >= previous, "backoff shrank at attempt {attempt}");
            prop_assert!(pause <= ceiling, "backoff exceeded cap at attempt {attempt}");
            previous = pause;
        }
    }

    /// Ascending distinct fractions always form a valid plan; the same
    /// fractions reversed never do.
    #[test]
    fn plans_accept_ascending_and_reject_descending(
        percents in arb_percents(99, 6)
    ) {
        let ascending = steps_from_percents(&percents);
        prop_assert!(FillPlan::new(ascending.clone()).is_ok());

        if ascending.len() > 1 {
            let mut descending = ascending;
            descending.reverse();
            prop_assert!(FillPlan::new(descending).is_err());
        }
    }

    /// An honest pool passes any plan that stays below the first alert
    /// threshold, and ends up holding exactly the final target.
    #[test]
    fn honest_pool_passes_any_below_threshold_plan(
        capacity in arb_capacity(),
        percents in arb_percents(69, 5)
    ) {
        let steps = steps_from_percents(&percents);
        let step_count = steps.len();
        let final_step = steps.last().unwrap().clone();

        let sim = SimulatedPool::new("prop-pool", capacity);
        let pool = sim.thin_pool().unwrap();
        let report =
            validate_capacity_sequence(&pool, steps, &sim.driver(), &sim.collector()).unwrap();

        prop_assert_eq!(report.outcome, RunOutcome::Passed);
        prop_assert_eq!(report.steps.len(), step_count);
        for step in &report.steps {
            prop_assert_eq!(step.outcome, StepOutcome::Passed);
            prop_assert!(step.alerts_firing.is_empty());
        }

        let expected_final = model_for(capacity).expected_occupied_bytes(&final_step);
        prop_assert_eq!(sim.occupied_bytes(), expected_final);
    }
}

// ──────────────────── non-proptest invariant tests ────────────────────

#[test]
fn standard_plan_is_strictly_ascending_with_alert_progression() {
    let plan = FillPlan::standard();
    let steps = plan.steps();
    assert_eq!(steps.len(), 3);

    for window in steps.windows(2) {
        assert!(window[0].target_fraction < window[1].target_fraction);
    }
    assert_eq!(steps[0].expected_alert, None);
    assert_eq!(steps[1].expected_alert.as_deref(), Some("tp_data_75_percent"));
    assert_eq!(steps[2].expected_alert.as_deref(), Some("tp_data_85_percent"));
}

#[test]
fn unit_multiplier_backoff_is_flat() {
    let policy = PollPolicy {
        backoff_multiplier: 1.0,
        initial_backoff: Duration::from_millis(250),
        max_backoff: Duration::from_millis(250),
        jitter_fraction: 0.0,
        ..PollPolicy::default()
    };
    for attempt in 1..10 {
        assert_eq!(policy.backoff_for(attempt), Duration::from_millis(250));
    }
}
