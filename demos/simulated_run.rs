//! Drive the standard fill sequence against an in-memory simulated pool,
//! then show how a lying metric backend fails the probe.
//!
//! Usage:
//!   cargo run --example simulated_run
//!
//! Demonstrates library-only usage: no real pool, backend, or filesystem
//! writes involved.

use capacity_alert_probe::metrics::alerts::{AlertEvaluator, TP_DATA_75_PERCENT};
use capacity_alert_probe::model::occupancy::ToleranceSpec;
use capacity_alert_probe::model::plan::{FillPlan, FillStep};
use capacity_alert_probe::probe::orchestrator::{
    FillSequenceOrchestrator, validate_capacity_sequence,
};
use capacity_alert_probe::sim::{ScriptedCollector, ScriptedLoadDriver, SimulatedPool};

const GIB: u64 = 1024 * 1024 * 1024;

fn main() {
    honest_pool();
    lying_backend();
}

/// An honest pool reports exactly what was written, so the standard
/// 70% / 77% / 87% plan passes and both threshold alerts fire on cue.
fn honest_pool() {
    println!("=== honest pool, standard plan ===");

    let sim = SimulatedPool::new("demo-pool", 100 * GIB);
    let pool = sim.thin_pool().expect("build pool identity");

    let report = validate_capacity_sequence(
        &pool,
        FillPlan::standard().steps().to_vec(),
        &sim.driver(),
        &sim.collector(),
    )
    .expect("honest pool passes");

    for step in &report.steps {
        let alerts = if step.alerts_firing.is_empty() {
            "none".to_string()
        } else {
            step.alerts_firing.join(", ")
        };
        println!(
            "  {:<12} expected {:>12} bytes, reported {:>6.2}%, alerts: {alerts}",
            step.label,
            step.expected_bytes,
            step.reported_percent.unwrap_or(0.0),
        );
    }
    println!("  {}", report.summary_line());
    println!("  pool now holds {} bytes\n", sim.occupied_bytes());
}

/// A backend that reports 95% while the pool holds 76% breaches the
/// tolerance, and the probe halts without ever consulting the alert API.
fn lying_backend() {
    println!("=== lying metric backend ===");

    let pool = capacity_alert_probe::model::pool::ThinPool::new("demo-pool", 100 * GIB)
        .expect("build pool identity");
    let driver = ScriptedLoadDriver::new();
    let collector = ScriptedCollector::new();
    collector.push_percent(95.0);

    let plan = FillPlan::new(vec![FillStep::new(
        "fill-to-76",
        0.76,
        Some(TP_DATA_75_PERCENT),
    )])
    .expect("valid plan");

    let mut orchestrator = FillSequenceOrchestrator::new(
        &pool,
        plan,
        ToleranceSpec::CapacityPercent(2.0),
        &driver,
        &collector,
        AlertEvaluator::default(),
    )
    .expect("build orchestrator");

    let err = orchestrator
        .run()
        .expect_err("95% against an expected 76% must fail");
    println!("  probe failed as expected: [{}] {err}", err.code());
    println!(
        "  alert backend consulted {} time(s)",
        collector.alert_calls()
    );
    println!("  {}", orchestrator.report().summary_line());
}
