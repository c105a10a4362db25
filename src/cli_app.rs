//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use capacity_alert_probe::core::config::Config;
use capacity_alert_probe::core::errors::CapError;
use capacity_alert_probe::load::driver::LoadDriver;
use capacity_alert_probe::load::file_writer::FileLoadDriver;
use capacity_alert_probe::logger::activity::{ActivityLoggerHandle, spawn_activity_logger};
use capacity_alert_probe::logger::history::RunHistoryDb;
use capacity_alert_probe::metrics::backend::MetricsCollector;
use capacity_alert_probe::metrics::exec::ExecMetricsCollector;
use capacity_alert_probe::model::occupancy::OccupancyModel;
use capacity_alert_probe::model::pool::ThinPool;
use capacity_alert_probe::probe::cancel::CancelToken;
use capacity_alert_probe::probe::orchestrator::FillSequenceOrchestrator;
use capacity_alert_probe::probe::report::{RunOutcome, RunReport, StepOutcome, StepReport};
use capacity_alert_probe::sim::SimulatedPool;

/// Capacity a simulated pool gets when neither config nor flags set one.
const SIM_DEFAULT_CAPACITY_BYTES: u64 = 100 * 1024 * 1024 * 1024;

/// Capacity Alert Probe — validates thin-pool capacity alerting end to end.
#[derive(Debug, Parser)]
#[command(
    name = "cap",
    author,
    version,
    about = "Capacity Alert Probe - thin-pool alert validation",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (verdict only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the fill sequence and validate metrics and alerts.
    Run(RunArgs),
    /// Print the resolved fill plan without driving any load.
    Plan(PlanArgs),
    /// Probe the metric and alert backends once and report reachability.
    Check(CheckArgs),
    /// Show recorded runs from the history database.
    History(HistoryArgs),
    /// View and update configuration state.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
    /// Show version and optional build metadata.
    Version(VersionArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum DriverKind {
    /// Write fill artifacts into the pool's filesystem.
    #[default]
    File,
    /// In-process simulated pool; no real IO, no real backend.
    Sim,
}

#[derive(Debug, Clone, Args, Default)]
struct RunArgs {
    /// Load driver to use.
    #[arg(long, value_enum, default_value_t = DriverKind::File)]
    driver: DriverKind,
    /// Directory fill artifacts are written into (file driver).
    #[arg(long, value_name = "DIR")]
    target_dir: Option<PathBuf>,
    /// Pool data capacity; overrides config and mount detection.
    #[arg(long, value_name = "BYTES")]
    capacity_bytes: Option<u64>,
    /// Seconds to wait after each fill before the first observation.
    #[arg(long, value_name = "SECONDS")]
    settle_secs: Option<u64>,
    /// Observation attempts per step before giving up.
    #[arg(long, value_name = "N")]
    max_attempts: Option<u32>,
    /// Occupancy tolerance as percent of capacity.
    #[arg(long, value_name = "PERCENT")]
    tolerance_percent: Option<f64>,
    /// Write the JSON run report to this path.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    /// Keep fill artifacts on disk after the run.
    #[arg(long)]
    no_cleanup: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct PlanArgs {}

#[derive(Debug, Clone, Args, Default)]
struct CheckArgs {}

#[derive(Debug, Clone, Args)]
struct HistoryArgs {
    /// Maximum number of runs to list.
    #[arg(long, default_value_t = 10, value_name = "N")]
    limit: u32,
    /// Show one run with its step records.
    #[arg(long, value_name = "RUN_ID")]
    id: Option<i64>,
    /// Delete runs older than the configured retention and exit.
    #[arg(long)]
    prune: bool,
}

impl Default for HistoryArgs {
    fn default() -> Self {
        Self {
            limit: 10,
            id: None,
            prune: false,
        }
    }
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
    /// Set a specific config key.
    Set(ConfigSetArgs),
}

#[derive(Debug, Clone, Args)]
struct ConfigSetArgs {
    /// Dot-path config key to set.
    key: String,
    /// New value to apply.
    value: String,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Args, Default)]
struct VersionArgs {
    /// Include additional build metadata fields.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// The probe ran and its verdict is FAIL.
    #[error("{0}")]
    Validation(String),
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Run interrupted or only partially completed.
    #[error("{0}")]
    Partial(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 1,
            Self::User(_) => 2,
            Self::Runtime(_) | Self::Json(_) | Self::Io(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

impl From<CapError> for CliError {
    fn from(e: CapError) -> Self {
        match &e {
            CapError::InvalidConfig { .. }
            | CapError::MissingConfig { .. }
            | CapError::ConfigParse { .. }
            | CapError::InvalidPlan { .. } => Self::User(e.to_string()),
            CapError::LoadFailed { .. }
            | CapError::MetricUnavailable { .. }
            | CapError::AlertBackendUnreachable { .. }
            | CapError::Staleness { .. }
            | CapError::ToleranceExceeded { .. }
            | CapError::AlertStateMismatch { .. } => Self::Validation(e.to_string()),
            CapError::Cancelled { .. } => Self::Partial(e.to_string()),
            _ => Self::Runtime(e.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run(args) => run_run(cli, args),
        Command::Plan(args) => run_plan(cli, args),
        Command::Check(args) => run_check(cli, args),
        Command::History(args) => run_history(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
        Command::Version(args) => emit_version(cli, args),
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Config::load(cli.config.as_deref()).map_err(CliError::from)
}

fn apply_run_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(dir) = &args.target_dir {
        config.paths.fill_dir.clone_from(dir);
    }
    if let Some(capacity) = args.capacity_bytes {
        config.pool.capacity_bytes = Some(capacity);
    }
    if let Some(settle) = args.settle_secs {
        config.polling.settle_secs = settle;
    }
    if let Some(attempts) = args.max_attempts {
        config.polling.max_attempts = attempts;
    }
    if let Some(tolerance) = args.tolerance_percent {
        config.comparison.tolerance_percent = tolerance;
        config.comparison.tolerance_bytes = None;
    }
    if let Some(path) = &args.report {
        config.report.path = Some(path.clone());
    }
    if args.no_cleanup {
        config.fill.cleanup = false;
    }
}

#[allow(clippy::too_many_lines)]
fn run_run(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let mut config = load_config(cli)?;
    apply_run_overrides(&mut config, args);
    config.validate().map_err(CliError::from)?;

    let plan = config.fill_plan().map_err(CliError::from)?;
    let cancel = CancelToken::new();
    #[cfg(unix)]
    cancel.register_signal_hooks();

    let activity = if config.logging.enabled {
        let (handle, join) =
            spawn_activity_logger(config.activity_config()).map_err(CliError::from)?;
        Some((handle, join))
    } else {
        None
    };

    // Driver and collector are picked together so a run is either fully
    // real or fully simulated.
    let mut cleanup_dir: Option<PathBuf> = None;
    let (pool, driver, collector): (ThinPool, Box<dyn LoadDriver>, Box<dyn MetricsCollector>) =
        match args.driver {
            DriverKind::File => {
                if config.backend.metrics_command.is_empty() {
                    return Err(CliError::User(
                        "backend.metrics_command is not configured; the file driver needs a real \
                         metrics backend (or use --driver sim)"
                            .to_string(),
                    ));
                }
                let driver =
                    FileLoadDriver::new(config.paths.fill_dir.clone()).map_err(CliError::from)?;
                let pool = resolve_pool(&config)?;
                if config.fill.cleanup {
                    cleanup_dir = Some(config.paths.fill_dir.clone());
                }
                let collector = ExecMetricsCollector::new(config.backend.collector_config())
                    .map_err(CliError::from)?;
                (pool, Box::new(driver), Box::new(collector))
            }
            DriverKind::Sim => {
                let capacity = args
                    .capacity_bytes
                    .or(config.pool.capacity_bytes)
                    .unwrap_or(SIM_DEFAULT_CAPACITY_BYTES);
                let sim = SimulatedPool::with_thresholds(
                    &config.pool.name,
                    capacity,
                    config.comparison.thresholds.clone(),
                );
                let pool = sim.thin_pool().map_err(CliError::from)?;
                (pool, Box::new(sim.driver()), Box::new(sim.collector()))
            }
        };

    if cli.verbose {
        let hash = config.stable_hash().map_err(CliError::from)?;
        eprintln!(
            "cap: pool {} capacity {} tolerance {} config {hash}",
            pool.name(),
            format_bytes(pool.total_capacity_bytes()),
            describe_tolerance(&config, &pool),
        );
    }

    let mut orchestrator = FillSequenceOrchestrator::new(
        &pool,
        plan,
        config.tolerance_spec(),
        driver.as_ref(),
        collector.as_ref(),
        config.evaluator(),
    )
    .map_err(CliError::from)?
    .with_policy(config.polling.policy())
    .with_settle_delay(config.settle_delay())
    .with_fill_options(config.fill.options())
    .with_cancel_token(cancel);
    if let Some((handle, _)) = &activity {
        orchestrator = orchestrator.with_activity(handle.clone());
    }

    let run_result = orchestrator.run();
    let report = orchestrator.report();

    if let Some(dir) = cleanup_dir {
        let cleanup = FileLoadDriver::new(dir).and_then(|d| d.remove_artifacts());
        if let Err(e) = cleanup {
            eprintln!("cap: WARNING: fill artifact cleanup failed: {e}");
        }
    }

    finish_activity(activity);
    persist_report(&config, &report)?;
    record_history(&config, &report);
    emit_run_output(cli, &report)?;

    match run_result {
        Ok(_) => Ok(()),
        Err(e) => Err(CliError::from(e)),
    }
}

/// Capacity from flags/config, else from the filesystem backing the fill
/// directory.
fn resolve_pool(config: &Config) -> Result<ThinPool, CliError> {
    if let Some(capacity) = config.pool.capacity_bytes {
        return ThinPool::new(&config.pool.name, capacity).map_err(CliError::from);
    }

    #[cfg(unix)]
    {
        ThinPool::from_mount(&config.pool.name, &config.paths.fill_dir).map_err(CliError::from)
    }
    #[cfg(not(unix))]
    {
        Err(CliError::User(
            "pool.capacity_bytes must be set on this platform".to_string(),
        ))
    }
}

fn describe_tolerance(config: &Config, pool: &ThinPool) -> String {
    OccupancyModel::new(pool, config.tolerance_spec()).map_or_else(
        |_| "unknown".to_string(),
        |model| format_bytes(model.tolerance_bytes()),
    )
}

fn finish_activity(activity: Option<(ActivityLoggerHandle, std::thread::JoinHandle<()>)>) {
    if let Some((handle, join)) = activity {
        handle.shutdown();
        if join.join().is_err() {
            eprintln!("cap: WARNING: activity logger thread panicked");
        }
    }
}

fn persist_report(config: &Config, report: &RunReport) -> Result<(), CliError> {
    if let Some(path) = &config.report.path {
        report
            .write_json(path, config.report.pretty)
            .map_err(|e| CliError::Runtime(format!("write report: {e}")))?;
    }
    Ok(())
}

/// History writes never mask the run verdict; failures are warnings.
fn record_history(config: &Config, report: &RunReport) {
    if !config.report.history_enabled {
        return;
    }
    let hash = match config.stable_hash() {
        Ok(hash) => hash,
        Err(e) => {
            eprintln!("[CAP-HISTORY] WARNING: config hash failed: {e}");
            return;
        }
    };
    let result = RunHistoryDb::open(&config.paths.sqlite_db).and_then(|mut db| {
        db.insert_run(report, &hash)?;
        let retention = u32::try_from(config.report.retention_days).unwrap_or(u32::MAX);
        db.prune_older_than(retention)
    });
    if let Err(e) = result {
        eprintln!("[CAP-HISTORY] WARNING: history not recorded: {e}");
    }
}

fn emit_run_output(cli: &Cli, report: &RunReport) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                for step in &report.steps {
                    print_step_line(step);
                }
            }
            let summary = report.summary_line();
            match report.outcome {
                RunOutcome::Passed => println!("{}", summary.green().bold()),
                RunOutcome::Failed => println!("{}", summary.red().bold()),
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "run",
                "report": serde_json::to_value(report)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn print_step_line(step: &StepReport) {
    let verdict = match step.outcome {
        StepOutcome::Passed => "ok".green(),
        StepOutcome::Failed => "FAIL".red(),
    };
    let reported = step
        .reported_percent
        .map_or_else(|| "-".to_string(), |p| format!("{p:.2}%"));
    let alerts = if step.alerts_firing.is_empty() {
        "none".to_string()
    } else {
        step.alerts_firing.join(", ")
    };
    println!(
        "  {:<16} {:>5.1}%  {verdict:<4}  {} attempt(s)  reported {reported:<8}  alerts: {alerts}",
        step.label,
        step.target_fraction * 100.0,
        step.attempts,
    );
    if let Some(error) = &step.error {
        println!("      {error}");
    }
}

fn run_plan(cli: &Cli, _args: &PlanArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let plan = config.fill_plan().map_err(CliError::from)?;

    let model = config
        .pool
        .capacity_bytes
        .and_then(|capacity| ThinPool::new(&config.pool.name, capacity).ok())
        .and_then(|pool| OccupancyModel::new(&pool, config.tolerance_spec()).ok());

    match output_mode(cli) {
        OutputMode::Human => {
            println!("Fill plan for pool {}:", config.pool.name);
            for step in plan.steps() {
                let expected = model.as_ref().map_or_else(
                    || "-".to_string(),
                    |m| format_bytes(m.expected_occupied_bytes(step)),
                );
                let alert = step.expected_alert.as_deref().unwrap_or("-");
                println!(
                    "  {:<16} {:>5.1}%  expected {expected:<10}  alert {alert}",
                    step.label,
                    step.target_fraction * 100.0,
                );
            }
            match &model {
                Some(m) => println!(
                    "Capacity {} with tolerance {}.",
                    format_bytes(m.capacity_bytes()),
                    format_bytes(m.tolerance_bytes()),
                ),
                None => println!("Capacity unknown; byte targets resolve at run time."),
            }
        }
        OutputMode::Json => {
            let steps: Vec<Value> = plan
                .steps()
                .iter()
                .map(|step| {
                    json!({
                        "label": step.label,
                        "target_fraction": step.target_fraction,
                        "expected_alert": step.expected_alert,
                        "expected_bytes": model.as_ref().map(|m| m.expected_occupied_bytes(step)),
                    })
                })
                .collect();
            let payload = json!({
                "command": "plan",
                "pool": config.pool.name,
                "capacity_bytes": config.pool.capacity_bytes,
                "tolerance_bytes": model.as_ref().map(|m| m.tolerance_bytes()),
                "steps": steps,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_check(cli: &Cli, _args: &CheckArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    if config.backend.metrics_command.is_empty() {
        return Err(CliError::User(
            "backend commands are not configured; set backend.metrics_command and \
             backend.alerts_command"
                .to_string(),
        ));
    }

    let collector =
        ExecMetricsCollector::new(config.backend.collector_config()).map_err(CliError::from)?;
    let metric = collector.fetch_percent_metric(&config.pool.name);
    let alerts = collector.fetch_alerts();
    let evaluator = config.evaluator();

    match output_mode(cli) {
        OutputMode::Human => {
            match &metric {
                Ok(sample) => println!(
                    "metric: {} {:.2}% via {}",
                    "ok".green(),
                    sample.value,
                    sample.metric
                ),
                Err(e) => println!("metric: {} {e}", "FAIL".red()),
            }
            match &alerts {
                Ok(snapshot) => {
                    let known = evaluator.known_firing(snapshot);
                    let firing = if known.is_empty() {
                        "none".to_string()
                    } else {
                        known.join(", ")
                    };
                    println!(
                        "alerts: {} {} total, threshold alerts firing: {firing}",
                        "ok".green(),
                        snapshot.len(),
                    );
                }
                Err(e) => println!("alerts: {} {e}", "FAIL".red()),
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "check",
                "metric": match &metric {
                    Ok(sample) => json!({
                        "ok": true,
                        "name": sample.metric,
                        "value": sample.value,
                        "observed_at": sample.observed_at,
                    }),
                    Err(e) => json!({ "ok": false, "error": e.to_string() }),
                },
                "alerts": match &alerts {
                    Ok(snapshot) => json!({
                        "ok": true,
                        "total": snapshot.len(),
                        "threshold_firing": evaluator.known_firing(snapshot),
                    }),
                    Err(e) => json!({ "ok": false, "error": e.to_string() }),
                },
            });
            write_json_line(&payload)?;
        }
    }

    if metric.is_err() || alerts.is_err() {
        return Err(CliError::Validation("backend check failed".to_string()));
    }
    Ok(())
}

fn run_history(cli: &Cli, args: &HistoryArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let db = RunHistoryDb::open(&config.paths.sqlite_db)
        .map_err(|e| CliError::Runtime(format!("open history db: {e}")))?;

    if args.prune {
        let retention = u32::try_from(config.report.retention_days).unwrap_or(u32::MAX);
        let pruned = db
            .prune_older_than(retention)
            .map_err(|e| CliError::Runtime(e.to_string()))?;
        match output_mode(cli) {
            OutputMode::Human => {
                println!("Pruned {pruned} run(s) older than {retention} day(s).");
            }
            OutputMode::Json => {
                let payload = json!({
                    "command": "history prune",
                    "pruned": pruned,
                    "retention_days": retention,
                });
                write_json_line(&payload)?;
            }
        }
        return Ok(());
    }

    if let Some(id) = args.id {
        let run = db
            .run_by_id(id)
            .map_err(|e| CliError::Runtime(e.to_string()))?
            .ok_or_else(|| CliError::User(format!("run {id} not found")))?;
        let steps = db
            .steps_for(id)
            .map_err(|e| CliError::Runtime(e.to_string()))?;

        match output_mode(cli) {
            OutputMode::Human => {
                println!(
                    "run {}  {}  pool {}  {}",
                    run.id,
                    run.started_at,
                    run.pool,
                    outcome_colored(&run.outcome),
                );
                if let Some(message) = &run.error_message {
                    println!("  error: {message}");
                }
                for step in &steps {
                    let reported = step
                        .reported_percent
                        .map_or_else(|| "-".to_string(), |p| format!("{p:.2}%"));
                    println!(
                        "  {:<16} {:>5.1}%  {}  {} attempt(s)  reported {reported}",
                        step.label,
                        step.target_fraction * 100.0,
                        outcome_colored(&step.outcome),
                        step.attempts,
                    );
                }
            }
            OutputMode::Json => {
                let payload = json!({
                    "command": "history show",
                    "run": serde_json::to_value(&run)?,
                    "steps": serde_json::to_value(&steps)?,
                });
                write_json_line(&payload)?;
            }
        }
        return Ok(());
    }

    let runs = db
        .recent_runs(args.limit)
        .map_err(|e| CliError::Runtime(e.to_string()))?;
    match output_mode(cli) {
        OutputMode::Human => {
            if runs.is_empty() {
                println!("No recorded runs in {}.", db.path().display());
            }
            for run in &runs {
                let code = run.error_code.as_deref().unwrap_or("-");
                println!(
                    "{:>5}  {}  {:<16} {:<7} {code}",
                    run.id,
                    run.started_at,
                    run.pool,
                    outcome_colored(&run.outcome).to_string(),
                );
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "history list",
                "runs": serde_json::to_value(&runs)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn outcome_colored(outcome: &str) -> colored::ColoredString {
    if outcome == "passed" {
        outcome.green()
    } else {
        outcome.red()
    }
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let value = serde_json::to_value(&config)?;
                    let payload = json!({
                        "command": "config show",
                        "config": value,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config
                    .stable_hash()
                    .map_err(|e| CliError::Runtime(e.to_string()))?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
        Some(ConfigCommand::Set(set_args)) => {
            let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

            // Read existing TOML or start from empty table.
            let mut toml_value: toml::Value = if config_path.exists() {
                let raw = std::fs::read_to_string(&config_path)
                    .map_err(|e| CliError::Runtime(format!("read config: {e}")))?;
                toml::from_str(&raw).map_err(|e| CliError::Runtime(format!("parse config: {e}")))?
            } else {
                toml::Value::Table(toml::map::Map::new())
            };

            set_toml_value(&mut toml_value, &set_args.key, &set_args.value)?;

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CliError::Runtime(format!("create config dir: {e}")))?;
            }
            let toml_str = toml::to_string_pretty(&toml_value)
                .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
            std::fs::write(&config_path, &toml_str)
                .map_err(|e| CliError::Runtime(format!("write config: {e}")))?;

            // Validate the resulting config.
            match Config::load(Some(&config_path)) {
                Ok(_) => {
                    match output_mode(cli) {
                        OutputMode::Human => {
                            println!(
                                "Set {} = {} in {}",
                                set_args.key,
                                set_args.value,
                                config_path.display()
                            );
                        }
                        OutputMode::Json => {
                            let payload = json!({
                                "command": "config set",
                                "key": set_args.key,
                                "value": set_args.value,
                                "path": config_path.to_string_lossy(),
                                "valid": true,
                            });
                            write_json_line(&payload)?;
                        }
                    }
                    Ok(())
                }
                Err(e) => {
                    match output_mode(cli) {
                        OutputMode::Human => {
                            println!(
                                "Set {} = {} in {}",
                                set_args.key,
                                set_args.value,
                                config_path.display()
                            );
                            eprintln!("Warning: resulting configuration is invalid: {e}");
                        }
                        OutputMode::Json => {
                            let payload = json!({
                                "command": "config set",
                                "key": set_args.key,
                                "value": set_args.value,
                                "path": config_path.to_string_lossy(),
                                "valid": false,
                                "validation_error": e.to_string(),
                            });
                            write_json_line(&payload)?;
                        }
                    }
                    Err(CliError::Partial(format!(
                        "value set but config invalid: {e}"
                    )))
                }
            }
        }
    }
}

/// Set a value in a TOML table using a dot-separated path.
fn set_toml_value(root: &mut toml::Value, dot_path: &str, raw_value: &str) -> Result<(), CliError> {
    let parts: Vec<&str> = dot_path.split('.').collect();
    if parts.is_empty() || parts.iter().any(|p| p.is_empty()) {
        return Err(CliError::User(format!("invalid config key: {dot_path:?}")));
    }

    let mut current = root;
    for &part in &parts[..parts.len() - 1] {
        current = current
            .as_table_mut()
            .ok_or_else(|| CliError::User(format!("key path component is not a table: {part}")))?
            .entry(part)
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }

    let table = current
        .as_table_mut()
        .ok_or_else(|| CliError::User("parent is not a table".to_string()))?;
    let key = parts[parts.len() - 1];
    table.insert(key.to_string(), parse_toml_value(raw_value));

    Ok(())
}

/// Parse a raw string into a TOML value, guessing the type.
fn parse_toml_value(raw: &str) -> toml::Value {
    if let Ok(b) = raw.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(raw.to_string())
}

fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    const TIB: u64 = 1024 * GIB;

    #[allow(clippy::cast_precision_loss)]
    if bytes >= TIB {
        format!("{:.1} TB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn emit_version(cli: &Cli, args: &VersionArgs) -> Result<(), CliError> {
    let version = env!("CARGO_PKG_VERSION");
    let package = env!("CARGO_PKG_NAME");
    let target = option_env!("TARGET").unwrap_or("unknown");
    let profile = option_env!("PROFILE").unwrap_or("unknown");
    let git_sha = option_env!("VERGEN_GIT_SHA")
        .or(option_env!("GIT_SHA"))
        .unwrap_or("unknown");
    let build_timestamp = option_env!("VERGEN_BUILD_TIMESTAMP")
        .or(option_env!("BUILD_TIMESTAMP"))
        .unwrap_or("unknown");

    match output_mode(cli) {
        OutputMode::Human => {
            println!("cap {version}");
            if args.verbose {
                println!("package: {package}");
                println!("target: {target}");
                println!("profile: {profile}");
                println!("git_sha: {git_sha}");
                println!("build_timestamp: {build_timestamp}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "binary": "cap",
                "version": version,
                "package": package,
                "build": {
                    "target": target,
                    "profile": profile,
                    "git_sha": git_sha,
                    "timestamp": build_timestamp,
                }
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("CAP_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        Some("auto") | None => fallback,
        Some(_) => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_before_and_after_subcommand() {
        let before = Cli::try_parse_from([
            "cap",
            "--config",
            "/tmp/cap.toml",
            "--json",
            "--no-color",
            "-v",
            "plan",
        ]);
        assert!(before.is_ok());

        let after = Cli::try_parse_from(["cap", "plan", "--json", "--no-color", "-v"]);
        assert!(after.is_ok());
    }

    #[test]
    fn parses_extended_subcommands() {
        let cases = [
            vec!["cap", "run"],
            vec!["cap", "run", "--driver", "sim", "--capacity-bytes", "1000000"],
            vec![
                "cap",
                "run",
                "--driver",
                "file",
                "--target-dir",
                "/data/cap-fill",
                "--settle-secs",
                "0",
                "--max-attempts",
                "3",
                "--tolerance-percent",
                "1.5",
                "--report",
                "/tmp/report.json",
                "--no-cleanup",
            ],
            vec!["cap", "plan"],
            vec!["cap", "check"],
            vec!["cap", "history", "--limit", "5"],
            vec!["cap", "history", "--id", "3"],
            vec!["cap", "history", "--prune"],
            vec!["cap", "config", "path"],
            vec!["cap", "config", "show"],
            vec!["cap", "config", "validate"],
            vec!["cap", "config", "set", "comparison.tolerance_percent", "1.0"],
            vec!["cap", "version", "--verbose"],
        ];

        for case in cases {
            let parsed = Cli::try_parse_from(case.clone());
            assert!(parsed.is_ok(), "failed to parse case: {case:?}");
        }
    }

    #[test]
    fn run_rejects_unknown_driver() {
        assert!(Cli::try_parse_from(["cap", "run", "--driver", "lvm"]).is_err());
    }

    #[test]
    fn completions_support_bash_zsh_and_fish() {
        for shell in ["bash", "zsh", "fish"] {
            let parsed = Cli::try_parse_from(["cap", "completions", shell]);
            assert!(parsed.is_ok(), "failed shell parse for {shell}");
        }
    }

    #[test]
    fn output_mode_resolution_honors_precedence() {
        assert_eq!(
            resolve_output_mode(true, Some("human"), true),
            OutputMode::Json
        );
        assert_eq!(
            resolve_output_mode(false, Some("json"), true),
            OutputMode::Json
        );
        assert_eq!(
            resolve_output_mode(false, Some("human"), false),
            OutputMode::Human
        );
        assert_eq!(
            resolve_output_mode(false, Some("auto"), true),
            OutputMode::Human
        );
        assert_eq!(resolve_output_mode(false, None, false), OutputMode::Json);
    }

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(CliError::Validation(String::new()).exit_code(), 1);
        assert_eq!(CliError::User(String::new()).exit_code(), 2);
        assert_eq!(CliError::Runtime(String::new()).exit_code(), 3);
        assert_eq!(CliError::Partial(String::new()).exit_code(), 4);
    }

    #[test]
    fn cap_errors_map_to_exit_classes() {
        let user: CliError = CapError::invalid_config("bad").into();
        assert!(matches!(user, CliError::User(_)));

        let validation: CliError = CapError::ToleranceExceeded {
            step: "fill-to-70".to_string(),
            expected_bytes: 100,
            actual_bytes: 200,
            delta_bytes: 100,
            tolerance_bytes: 10,
        }
        .into();
        assert!(matches!(validation, CliError::Validation(_)));

        let partial: CliError = CapError::Cancelled {
            step: "fill-to-70".to_string(),
        }
        .into();
        assert!(matches!(partial, CliError::Partial(_)));

        let runtime: CliError = CapError::runtime("boom").into();
        assert!(matches!(runtime, CliError::Runtime(_)));
    }

    #[test]
    fn set_toml_value_creates_nested_tables() {
        let mut root = toml::Value::Table(toml::map::Map::new());
        set_toml_value(&mut root, "comparison.tolerance_percent", "1.5").unwrap();
        set_toml_value(&mut root, "pool.name", "ssd-thin-a").unwrap();

        let comparison = root.get("comparison").and_then(|v| v.as_table()).unwrap();
        assert_eq!(
            comparison.get("tolerance_percent"),
            Some(&toml::Value::Float(1.5))
        );
        let pool = root.get("pool").and_then(|v| v.as_table()).unwrap();
        assert_eq!(
            pool.get("name"),
            Some(&toml::Value::String("ssd-thin-a".to_string()))
        );
    }

    #[test]
    fn set_toml_value_rejects_empty_key() {
        let mut root = toml::Value::Table(toml::map::Map::new());
        assert!(set_toml_value(&mut root, "", "1").is_err());
        assert!(set_toml_value(&mut root, "pool..name", "x").is_err());
    }

    #[test]
    fn parse_toml_value_guesses_types() {
        assert_eq!(parse_toml_value("true"), toml::Value::Boolean(true));
        assert_eq!(parse_toml_value("42"), toml::Value::Integer(42));
        assert_eq!(parse_toml_value("1.5"), toml::Value::Float(1.5));
        assert_eq!(
            parse_toml_value("thin-pool"),
            toml::Value::String("thin-pool".to_string())
        );
    }

    #[test]
    fn format_bytes_scales_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(100 * 1024 * 1024 * 1024), "100.0 GB");
    }

    #[test]
    fn help_includes_command_surface() {
        let mut cmd = Cli::command();
        let help = cmd.render_long_help().to_string();
        for keyword in [
            "run",
            "plan",
            "check",
            "history",
            "config",
            "completions",
            "version",
        ] {
            assert!(
                help.contains(keyword),
                "help output missing command: {keyword}"
            );
        }
    }
}
