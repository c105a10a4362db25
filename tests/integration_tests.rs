//! Integration tests: CLI smoke tests plus full-sequence scenarios driven
//! through the library API with scripted backends.

mod common;

use std::time::{Duration, Instant};

use serde_json::Value;
use capacity_alert_probe::metrics::alerts::{
    AlertEvaluator, TP_DATA_75_PERCENT, TP_DATA_85_PERCENT,
};
use capacity_alert_probe::model::occupancy::ToleranceSpec;
use capacity_alert_probe::model::plan::{FillPlan, FillStep};
use capacity_alert_probe::model::pool::ThinPool;
use capacity_alert_probe::probe::cancel::CancelToken;
use capacity_alert_probe::probe::orchestrator::{
    FillSequenceOrchestrator, validate_capacity_sequence,
};
use capacity_alert_probe::probe::poll::PollPolicy;
use capacity_alert_probe::probe::report::{RunOutcome, StepOutcome};
use capacity_alert_probe::sim::{ScriptedCollector, ScriptedLoadDriver, SimulatedPool};

const GIB: u64 = 1024 * 1024 * 1024;

// ──────────────────── CLI smoke tests ────────────────────

#[test]
fn help_command_prints_usage() {
    let result = common::run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: cap"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn version_flag_prints_version() {
    let result = common::run_cli_case("version_flag_prints_version", &["--version"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("cap"),
        "missing version output; log: {}",
        result.log_path.display()
    );
}

#[test]
fn subcommand_help_flags_work() {
    let subcommands = [
        "run",
        "plan",
        "check",
        "history",
        "config",
        "completions",
        "version",
    ];

    for subcmd in subcommands {
        let case_name = format!("subcommand_{subcmd}_help");
        let result = common::run_cli_case(&case_name, &[subcmd, "--help"]);
        assert!(
            result.status.success(),
            "subcommand '{subcmd} --help' failed; log: {}",
            result.log_path.display()
        );
        assert!(
            result.stdout.contains("Usage") || result.stdout.contains("usage"),
            "subcommand '{subcmd} --help' missing usage; log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn simulated_run_passes_end_to_end() {
    let result = common::run_cli_case(
        "simulated_run_passes_end_to_end",
        &["run", "--driver", "sim", "--settle-secs", "0"],
    );
    assert!(
        result.status.success(),
        "simulated run failed; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("PASS pool thin-pool"),
        "missing pass verdict; log: {}",
        result.log_path.display()
    );
}

#[test]
fn simulated_run_emits_json_report() {
    let result = common::run_cli_case(
        "simulated_run_emits_json_report",
        &["--json", "run", "--driver", "sim", "--settle-secs", "0"],
    );
    assert!(
        result.status.success(),
        "simulated run failed; log: {}",
        result.log_path.display()
    );

    let payload: Value = serde_json::from_str(result.stdout.trim())
        .unwrap_or_else(|e| panic!("stdout is not JSON ({e}); log: {}", result.log_path.display()));
    assert_eq!(payload["command"], "run");
    assert_eq!(payload["report"]["outcome"], "passed");
    assert_eq!(payload["report"]["steps"].as_array().map(Vec::len), Some(3));
}

#[test]
fn quiet_run_prints_only_the_verdict() {
    let result = common::run_cli_case(
        "quiet_run_prints_only_the_verdict",
        &["--quiet", "run", "--driver", "sim", "--settle-secs", "0"],
    );
    assert!(
        result.status.success(),
        "quiet run failed; log: {}",
        result.log_path.display()
    );
    let lines: Vec<&str> = result.stdout.lines().filter(|l| !l.is_empty()).collect();
    assert_eq!(
        lines.len(),
        1,
        "quiet mode should print one line; log: {}",
        result.log_path.display()
    );
}

#[test]
fn plan_lists_the_standard_steps() {
    let result = common::run_cli_case("plan_lists_the_standard_steps", &["plan"]);
    assert!(
        result.status.success(),
        "plan failed; log: {}",
        result.log_path.display()
    );
    for label in ["fill-to-70", "fill-to-77", "fill-to-87"] {
        assert!(
            result.stdout.contains(label),
            "plan output missing {label}; log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn plan_json_resolves_bytes_when_capacity_is_known() {
    let result = common::run_cli_case_with_env(
        "plan_json_resolves_bytes",
        &["--json", "plan"],
        &[("CAP_POOL_CAPACITY_BYTES", "107374182400")],
    );
    assert!(
        result.status.success(),
        "plan failed; log: {}",
        result.log_path.display()
    );

    let payload: Value = serde_json::from_str(result.stdout.trim())
        .unwrap_or_else(|e| panic!("stdout is not JSON ({e}); log: {}", result.log_path.display()));
    let steps = payload["steps"].as_array().expect("steps array");
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0]["expected_bytes"].as_u64(), Some(70 * GIB));
    assert_eq!(steps[1]["expected_alert"], "tp_data_75_percent");
}

#[test]
fn check_without_backend_is_a_user_error() {
    let result = common::run_cli_case("check_without_backend", &["check"]);
    assert_eq!(
        result.status.code(),
        Some(2),
        "expected user-error exit; log: {}",
        result.log_path.display()
    );
}

#[test]
fn file_run_without_backend_is_a_user_error() {
    let result = common::run_cli_case(
        "file_run_without_backend",
        &["run", "--driver", "file", "--capacity-bytes", "1073741824"],
    );
    assert_eq!(
        result.status.code(),
        Some(2),
        "expected user-error exit; log: {}",
        result.log_path.display()
    );
}

#[test]
fn config_validate_accepts_the_defaults() {
    let result = common::run_cli_case("config_validate_defaults", &["config", "validate"]);
    assert!(
        result.status.success(),
        "config validate failed; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Configuration is valid."),
        "missing validity line; log: {}",
        result.log_path.display()
    );
}

#[test]
fn config_set_writes_the_key_to_disk() {
    let result = common::run_cli_case(
        "config_set_writes_key",
        &["config", "set", "comparison.tolerance_percent", "1.5"],
    );
    assert!(
        result.status.success(),
        "config set failed; log: {}",
        result.log_path.display()
    );

    let config_path = result.home.join(".config/cap/config.toml");
    let written = std::fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("read {} failed: {e}", config_path.display()));
    assert!(written.contains("tolerance_percent"));
    assert!(written.contains("1.5"));
}

#[test]
fn history_starts_empty() {
    let result = common::run_cli_case("history_starts_empty", &["history"]);
    assert!(
        result.status.success(),
        "history failed; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("No recorded runs"),
        "expected empty history; log: {}",
        result.log_path.display()
    );
}

#[test]
fn completions_generate_for_bash() {
    let result = common::run_cli_case("completions_bash", &["completions", "bash"]);
    assert!(
        result.status.success(),
        "completions failed; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("cap"),
        "completion script missing binary name; log: {}",
        result.log_path.display()
    );
}

// ──────────────────── scenario fixtures ────────────────────

fn pool_100_gib() -> ThinPool {
    ThinPool::new("tp-data", 100 * GIB).unwrap()
}

fn step(label: &str, fraction: f64, alert: Option<&str>) -> FillStep {
    FillStep::new(label, fraction, alert)
}

fn fast_policy(max_attempts: u32) -> PollPolicy {
    PollPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        backoff_multiplier: 1.0,
        max_backoff: Duration::from_millis(1),
        jitter_fraction: 0.0,
        max_elapsed: Duration::from_secs(10),
    }
}

fn orchestrator<'a>(
    pool: &ThinPool,
    steps: Vec<FillStep>,
    driver: &'a ScriptedLoadDriver,
    collector: &'a ScriptedCollector,
) -> FillSequenceOrchestrator<'a> {
    FillSequenceOrchestrator::new(
        pool,
        FillPlan::new(steps).unwrap(),
        ToleranceSpec::CapacityPercent(2.0),
        driver,
        collector,
        AlertEvaluator::default(),
    )
    .unwrap()
    .with_policy(fast_policy(10))
}

// ──────────────────── full-sequence scenarios ────────────────────

#[test]
fn step_to_seventy_percent_with_close_metric_passes() {
    let pool = pool_100_gib();
    let driver = ScriptedLoadDriver::new();
    let collector = ScriptedCollector::new();
    collector.push_percent(69.5);
    collector.push_alerts(&[]);

    let mut orch = orchestrator(&pool, vec![step("fill-to-70", 0.70, None)], &driver, &collector);
    let report = orch.run().expect("close metric must pass");

    assert_eq!(report.outcome, RunOutcome::Passed);
    assert_eq!(report.steps[0].outcome, StepOutcome::Passed);
    assert_eq!(report.steps[0].reported_percent, Some(69.5));
    assert_eq!(driver.requests()[0].target_bytes, 70 * GIB);
}

#[test]
fn expected_alert_present_at_its_step_passes() {
    let pool = pool_100_gib();
    let driver = ScriptedLoadDriver::new();
    let collector = ScriptedCollector::new();
    collector.push_percent(70.0);
    collector.push_percent(76.2);
    collector.push_alerts(&[]);
    collector.push_alerts(&[TP_DATA_75_PERCENT]);

    let steps = vec![
        step("fill-to-70", 0.70, None),
        step("fill-to-76", 0.76, Some(TP_DATA_75_PERCENT)),
    ];
    let mut orch = orchestrator(&pool, steps, &driver, &collector);
    let report = orch.run().expect("firing alert must satisfy the step");

    assert_eq!(report.outcome, RunOutcome::Passed);
    assert_eq!(
        report.steps[1].alerts_firing,
        vec![TP_DATA_75_PERCENT.to_string()]
    );
}

#[test]
fn expected_alert_missing_at_its_step_is_a_mismatch() {
    let pool = pool_100_gib();
    let driver = ScriptedLoadDriver::new();
    let collector = ScriptedCollector::new();
    collector.push_percent(70.0);
    collector.push_percent(76.2);
    collector.push_alerts(&[]);

    let steps = vec![
        step("fill-to-70", 0.70, None),
        step("fill-to-76", 0.76, Some(TP_DATA_75_PERCENT)),
    ];
    let mut orch = orchestrator(&pool, steps, &driver, &collector);
    let err = orch.run().expect_err("silent alert must fail the step");

    assert_eq!(err.code(), "CAP-4002");
    assert!(err.to_string().contains(TP_DATA_75_PERCENT));

    let report = orch.report();
    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.steps[0].outcome, StepOutcome::Passed);
    assert_eq!(report.steps[1].outcome, StepOutcome::Failed);
}

#[test]
fn wild_metric_halts_before_the_alert_backend_is_touched() {
    let pool = pool_100_gib();
    let driver = ScriptedLoadDriver::new();
    let collector = ScriptedCollector::new();
    collector.push_percent(95.0);

    let steps = vec![step("fill-to-76", 0.76, Some(TP_DATA_75_PERCENT))];
    let mut orch = orchestrator(&pool, steps, &driver, &collector);
    let err = orch.run().expect_err("19-point gap must exceed tolerance");

    assert_eq!(err.code(), "CAP-4001");
    assert_eq!(
        collector.alert_calls(),
        0,
        "tolerance verdict must come before any alert fetch"
    );
}

#[test]
fn transient_metric_outage_retries_to_success() {
    let pool = pool_100_gib();
    let driver = ScriptedLoadDriver::new();
    let collector = ScriptedCollector::new();
    collector.push_metric_unavailable("gateway timeout");
    collector.push_metric_unavailable("gateway timeout");
    collector.push_metric_unavailable("gateway timeout");
    collector.push_percent(70.0);
    collector.push_alerts(&[]);

    let mut orch = orchestrator(&pool, vec![step("fill-to-70", 0.70, None)], &driver, &collector);
    let report = orch.run().expect("fourth attempt must succeed");

    assert_eq!(report.outcome, RunOutcome::Passed);
    assert_eq!(report.steps[0].attempts, 4);
    assert_eq!(collector.metric_calls(), 4);
}

#[test]
fn exhausted_retry_budget_surfaces_staleness() {
    let pool = pool_100_gib();
    let driver = ScriptedLoadDriver::new();
    let collector = ScriptedCollector::new();
    collector.push_metric_unavailable("scrape target down");

    let mut orch = FillSequenceOrchestrator::new(
        &pool,
        FillPlan::new(vec![step("fill-to-70", 0.70, None)]).unwrap(),
        ToleranceSpec::CapacityPercent(2.0),
        &driver,
        &collector,
        AlertEvaluator::default(),
    )
    .unwrap()
    .with_policy(fast_policy(5));
    let err = orch.run().expect_err("budget exhaustion must fail");

    assert_eq!(err.code(), "CAP-3101");
    let message = err.to_string();
    assert!(message.contains("fill-to-70"), "got: {message}");
    assert!(message.contains("after 5 attempts"), "got: {message}");
    assert_eq!(collector.metric_calls(), 5);
    assert_eq!(orch.report().steps[0].attempts, 5);
}

#[test]
fn standard_sequence_passes_against_an_honest_pool() {
    let sim = SimulatedPool::new("tp-data", 100 * GIB);
    let pool = sim.thin_pool().unwrap();

    let report = validate_capacity_sequence(
        &pool,
        FillPlan::standard().steps().to_vec(),
        &sim.driver(),
        &sim.collector(),
    )
    .expect("honest pool must pass the standard plan");

    assert_eq!(report.outcome, RunOutcome::Passed);
    assert_eq!(report.steps.len(), 3);
    assert!(report.steps[0].alerts_firing.is_empty());
    assert!(
        report.steps[1]
            .alerts_firing
            .contains(&TP_DATA_75_PERCENT.to_string())
    );
    assert!(
        report.steps[2]
            .alerts_firing
            .contains(&TP_DATA_85_PERCENT.to_string())
    );
    assert_eq!(sim.occupied_bytes(), 100 * GIB * 87 / 100);
}

#[test]
fn failed_step_halts_the_rest_of_the_sequence() {
    let pool = pool_100_gib();
    let driver = ScriptedLoadDriver::new();
    let collector = ScriptedCollector::new();
    collector.push_percent(70.0);
    collector.push_percent(95.0);
    collector.push_alerts(&[]);

    let steps = vec![
        step("fill-to-70", 0.70, None),
        step("fill-to-76", 0.76, Some(TP_DATA_75_PERCENT)),
        step("fill-to-87", 0.87, Some(TP_DATA_85_PERCENT)),
    ];
    let mut orch = orchestrator(&pool, steps, &driver, &collector);
    let err = orch.run().expect_err("second step must fail");

    assert_eq!(err.code(), "CAP-4001");
    assert_eq!(driver.fill_count(), 2, "third step must never be filled");
    assert_eq!(orch.report().steps.len(), 2);
}

#[test]
fn cancellation_stops_the_run_between_phases() {
    let pool = pool_100_gib();
    let driver = ScriptedLoadDriver::new();
    driver.pace(Duration::from_millis(200));
    let collector = ScriptedCollector::new();
    collector.push_percent(70.0);
    collector.push_alerts(&[]);

    let token = CancelToken::new();
    let canceller = token.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });

    let started = Instant::now();
    let mut orch = orchestrator(&pool, vec![step("fill-to-70", 0.70, None)], &driver, &collector)
        .with_cancel_token(token);
    let err = orch.run().expect_err("cancelled run must fail");
    handle.join().unwrap();

    assert_eq!(err.code(), "CAP-5001");
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "cancellation must not wait out the whole sequence"
    );
    assert_eq!(orch.report().outcome, RunOutcome::Failed);
}

#[test]
fn report_survives_a_round_trip_through_disk() {
    let sim = SimulatedPool::new("tp-data", 100 * GIB);
    let pool = sim.thin_pool().unwrap();
    let report = validate_capacity_sequence(
        &pool,
        FillPlan::standard().steps().to_vec(),
        &sim.driver(),
        &sim.collector(),
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    report.write_json(&path, true).unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let parsed: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed["outcome"], "passed");
    assert_eq!(parsed["pool"], "tp-data");
    assert_eq!(parsed["steps"].as_array().map(Vec::len), Some(3));
    assert_eq!(parsed["capacity_bytes"].as_u64(), Some(100 * GIB));
}
