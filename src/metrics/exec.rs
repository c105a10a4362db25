//! Collector that shells out to fetch metric and alert state.
//!
//! Each fetch runs the configured command exactly once. Retry policy lives in
//! the orchestrator's poll loop, never here.

use std::process::{Command, Stdio};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, bounded};

use crate::core::errors::{CapError, Result};
use crate::metrics::alerts::parse_alert_payload;
use crate::metrics::backend::{AlertSnapshot, MetricSample, MetricsCollector};
use crate::metrics::exposition::ExpositionParser;

/// How the exec collector reaches its backends.
#[derive(Debug, Clone)]
pub struct ExecCollectorConfig {
    /// Command printing a Prometheus exposition body on stdout.
    pub metrics_command: Vec<String>,
    /// Command printing alert state as JSON on stdout.
    pub alerts_command: Vec<String>,
    /// Name of the fill-percentage series to select.
    pub metric_name: String,
    /// Kill-and-fail deadline for a single command run.
    pub timeout: Duration,
}

/// [`MetricsCollector`] backed by external commands (`curl`, `kubectl`, a
/// vendor CLI). One process execution per fetch.
#[derive(Debug)]
pub struct ExecMetricsCollector {
    config: ExecCollectorConfig,
    parser: ExpositionParser,
}

impl ExecMetricsCollector {
    /// Build a collector. Both commands must be non-empty.
    pub fn new(config: ExecCollectorConfig) -> Result<Self> {
        if config.metrics_command.is_empty() {
            return Err(CapError::invalid_config(
                "backend.metrics_command is empty",
            ));
        }
        if config.alerts_command.is_empty() {
            return Err(CapError::invalid_config("backend.alerts_command is empty"));
        }
        if config.metric_name.trim().is_empty() {
            return Err(CapError::invalid_config("backend.metric_name is empty"));
        }
        Ok(Self {
            config,
            parser: ExpositionParser::new()?,
        })
    }
}

impl MetricsCollector for ExecMetricsCollector {
    fn fetch_percent_metric(&self, pool: &str) -> Result<MetricSample> {
        let text = run_capture(&self.config.metrics_command, self.config.timeout)
            .map_err(CapError::metric_unavailable)?;
        self.parser
            .select_percent(&text, &self.config.metric_name, pool)
    }

    fn fetch_alerts(&self) -> Result<AlertSnapshot> {
        let body = run_capture(&self.config.alerts_command, self.config.timeout)
            .map_err(CapError::alert_backend)?;
        parse_alert_payload(&body)
    }
}

/// Run `argv` once, capturing stdout. Kills the child when `timeout` passes.
fn run_capture(argv: &[String], timeout: Duration) -> std::result::Result<String, String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "command is empty".to_string())?;

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| format!("failed to spawn {program}: {error}"))?;
    let pid = child.id();

    // The child is reaped on a helper thread so the caller can enforce the
    // deadline with a channel wait instead of polling.
    let (tx, rx) = bounded(1);
    std::thread::spawn(move || {
        let _ = tx.send(child.wait_with_output());
    });

    let output = match rx.recv_timeout(timeout) {
        Ok(Ok(output)) => output,
        Ok(Err(error)) => return Err(format!("failed to run {program}: {error}")),
        Err(RecvTimeoutError::Timeout) => {
            kill_child(pid);
            return Err(format!("{program} timed out after {timeout:?}"));
        }
        Err(RecvTimeoutError::Disconnected) => {
            return Err(format!("{program} worker thread exited early"));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        return if stderr.is_empty() {
            Err(format!("{program} exited with {}", output.status))
        } else {
            Err(format!(
                "{program} exited with {}: {stderr}",
                output.status
            ))
        };
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(unix)]
fn kill_child(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(pid) {
        let _ = kill(Pid::from_raw(raw), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_child(_pid: u32) {}
