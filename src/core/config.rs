//! Configuration system: TOML file + env var overrides + defaults.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CapError, Result};
use crate::load::driver::{FillOptions, IoPattern};
use crate::logger::activity::ActivityLoggerConfig;
use crate::logger::jsonl::JsonlConfig;
use crate::metrics::alerts::AlertEvaluator;
use crate::metrics::exec::ExecCollectorConfig;
use crate::model::occupancy::ToleranceSpec;
use crate::model::plan::{FillPlan, FillStep};
use crate::probe::poll::PollPolicy;

/// Full probe configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub steps: Vec<StepConfig>,
    pub comparison: ComparisonConfig,
    pub polling: PollingConfig,
    pub fill: FillConfig,
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
    pub report: ReportConfig,
    pub paths: PathsConfig,
}

/// The pool under test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    pub name: String,
    /// Total data capacity. When absent the CLI resolves it from the
    /// filesystem backing the fill directory.
    pub capacity_bytes: Option<u64>,
}

/// One fill step as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepConfig {
    pub label: String,
    pub target_fraction: f64,
    #[serde(default)]
    pub expected_alert: Option<String>,
}

impl From<&FillStep> for StepConfig {
    fn from(step: &FillStep) -> Self {
        Self {
            label: step.label.clone(),
            target_fraction: step.target_fraction,
            expected_alert: step.expected_alert.clone(),
        }
    }
}

/// Tolerance and alert threshold registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComparisonConfig {
    pub tolerance_percent: f64,
    /// Absolute override; wins over `tolerance_percent` when set.
    pub tolerance_bytes: Option<u64>,
    /// Alert id to firing threshold in percent of capacity.
    pub thresholds: BTreeMap<String, f64>,
}

/// Retry budget for observations plus the post-fill settle delay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub jitter_fraction: f64,
    pub max_elapsed_secs: u64,
    pub settle_secs: u64,
}

/// Load generation tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FillConfig {
    pub block_size_bytes: u64,
    pub queue_depth: u32,
    pub read_write_ratio: f64,
    pub rate_limit_bytes_per_sec: Option<u64>,
    pub io_pattern: IoPattern,
    pub fsync_every_bytes: u64,
    /// Remove fill artifacts once the run finishes.
    pub cleanup: bool,
}

/// Commands the exec collector shells out to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    pub metrics_command: Vec<String>,
    pub alerts_command: Vec<String>,
    pub metric_name: String,
    pub timeout_secs: u64,
}

/// JSONL activity stream tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub fallback_path: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    pub fsync_interval_secs: u64,
    pub channel_capacity: usize,
}

/// Report output and run history retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportConfig {
    /// Write the JSON run report here when set.
    pub path: Option<PathBuf>,
    pub pretty: bool,
    pub history_enabled: bool,
    pub retention_days: u64,
}

/// Filesystem paths used by cap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub fill_dir: PathBuf,
    pub sqlite_db: PathBuf,
    pub jsonl_log: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            steps: default_steps(),
            comparison: ComparisonConfig::default(),
            polling: PollingConfig::default(),
            fill: FillConfig::default(),
            backend: BackendConfig::default(),
            logging: LoggingConfig::default(),
            report: ReportConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

fn default_steps() -> Vec<StepConfig> {
    FillPlan::standard().steps().iter().map(StepConfig::from).collect()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "thin-pool".to_string(),
            capacity_bytes: None,
        }
    }
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        let mut thresholds = BTreeMap::new();
        thresholds.insert(crate::metrics::alerts::TP_DATA_75_PERCENT.to_string(), 75.0);
        thresholds.insert(crate::metrics::alerts::TP_DATA_85_PERCENT.to_string(), 85.0);
        Self {
            tolerance_percent: 2.0,
            tolerance_bytes: None,
            thresholds,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 2_000,
            backoff_multiplier: 1.5,
            max_backoff_ms: 60_000,
            jitter_fraction: 0.1,
            max_elapsed_secs: 600,
            settle_secs: 60,
        }
    }
}

impl Default for FillConfig {
    fn default() -> Self {
        let options = FillOptions::default();
        Self {
            block_size_bytes: options.block_size_bytes,
            queue_depth: options.queue_depth,
            read_write_ratio: options.read_write_ratio,
            rate_limit_bytes_per_sec: options.rate_limit_bytes_per_sec,
            io_pattern: options.io_pattern,
            fsync_every_bytes: options.fsync_every_bytes,
            cleanup: true,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            metrics_command: Vec::new(),
            alerts_command: Vec::new(),
            metric_name: crate::metrics::exposition::DEFAULT_METRIC_NAME.to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let jsonl = JsonlConfig::default();
        Self {
            enabled: true,
            fallback_path: jsonl.fallback_path,
            max_size_bytes: jsonl.max_size_bytes,
            max_rotated_files: jsonl.max_rotated_files,
            fsync_interval_secs: jsonl.fsync_interval_secs,
            channel_capacity: 256,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            path: None,
            pretty: true,
            history_enabled: true,
            retention_days: 90,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[CAP-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("cap").join("config.toml");
        let data = home_dir.join(".local").join("share").join("cap");
        Self {
            config_file: cfg,
            fill_dir: data.join("fill"),
            sqlite_db: data.join("history.sqlite3"),
            jsonl_log: data.join("activity.jsonl"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path;
    /// defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| CapError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(CapError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides()?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config, recorded alongside each
    /// run so history rows can be traced to the settings that produced them.
    ///
    /// FNV-1a over the canonical JSON form; stable across processes and
    /// Rust releases.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// The validated fill plan described by `steps`.
    pub fn fill_plan(&self) -> Result<FillPlan> {
        let steps = self
            .steps
            .iter()
            .map(|s| FillStep::new(s.label.clone(), s.target_fraction, s.expected_alert.as_deref()))
            .collect();
        FillPlan::new(steps)
    }

    /// Tolerance for the metric comparison. An absolute byte override wins.
    #[must_use]
    pub fn tolerance_spec(&self) -> ToleranceSpec {
        self.comparison.tolerance_bytes.map_or(
            ToleranceSpec::CapacityPercent(self.comparison.tolerance_percent),
            ToleranceSpec::Bytes,
        )
    }

    /// Alert evaluator over the configured threshold registry.
    #[must_use]
    pub fn evaluator(&self) -> AlertEvaluator {
        AlertEvaluator::from_thresholds(&self.comparison.thresholds)
    }

    /// Post-fill settle delay.
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.polling.settle_secs)
    }

    /// JSONL writer settings assembled from `paths` and `logging`.
    #[must_use]
    pub fn jsonl_config(&self) -> JsonlConfig {
        JsonlConfig {
            path: self.paths.jsonl_log.clone(),
            fallback_path: self.logging.fallback_path.clone(),
            max_size_bytes: self.logging.max_size_bytes,
            max_rotated_files: self.logging.max_rotated_files,
            fsync_interval_secs: self.logging.fsync_interval_secs,
        }
    }

    /// Activity logger settings.
    #[must_use]
    pub fn activity_config(&self) -> ActivityLoggerConfig {
        ActivityLoggerConfig {
            jsonl_config: self.jsonl_config(),
            channel_capacity: self.logging.channel_capacity,
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        // pool
        if let Some(raw) = env_var("CAP_POOL_NAME") {
            self.pool.name = raw;
        }
        if let Some(raw) = env_var("CAP_POOL_CAPACITY_BYTES") {
            self.pool.capacity_bytes = Some(parse_env_u64("CAP_POOL_CAPACITY_BYTES", &raw)?);
        }

        // comparison
        set_env_f64(
            "CAP_TOLERANCE_PERCENT",
            &mut self.comparison.tolerance_percent,
        )?;
        if let Some(raw) = env_var("CAP_TOLERANCE_BYTES") {
            self.comparison.tolerance_bytes = Some(parse_env_u64("CAP_TOLERANCE_BYTES", &raw)?);
        }

        // polling
        set_env_u32("CAP_POLL_MAX_ATTEMPTS", &mut self.polling.max_attempts)?;
        set_env_u64(
            "CAP_POLL_INITIAL_BACKOFF_MS",
            &mut self.polling.initial_backoff_ms,
        )?;
        set_env_f64(
            "CAP_POLL_BACKOFF_MULTIPLIER",
            &mut self.polling.backoff_multiplier,
        )?;
        set_env_u64("CAP_POLL_MAX_BACKOFF_MS", &mut self.polling.max_backoff_ms)?;
        set_env_f64(
            "CAP_POLL_JITTER_FRACTION",
            &mut self.polling.jitter_fraction,
        )?;
        set_env_u64(
            "CAP_POLL_MAX_ELAPSED_SECS",
            &mut self.polling.max_elapsed_secs,
        )?;
        set_env_u64("CAP_SETTLE_SECS", &mut self.polling.settle_secs)?;

        // fill
        set_env_u64("CAP_FILL_BLOCK_SIZE_BYTES", &mut self.fill.block_size_bytes)?;
        set_env_u32("CAP_FILL_QUEUE_DEPTH", &mut self.fill.queue_depth)?;
        set_env_f64("CAP_FILL_READ_WRITE_RATIO", &mut self.fill.read_write_ratio)?;
        if let Some(raw) = env_var("CAP_FILL_RATE_LIMIT_BYTES_PER_SEC") {
            self.fill.rate_limit_bytes_per_sec =
                Some(parse_env_u64("CAP_FILL_RATE_LIMIT_BYTES_PER_SEC", &raw)?);
        }
        set_env_bool("CAP_FILL_CLEANUP", &mut self.fill.cleanup)?;
        if let Some(raw) = env_var("CAP_FILL_DIR") {
            self.paths.fill_dir = PathBuf::from(raw);
        }

        // backend
        self.apply_backend_env_overrides_from(env_var)?;

        // persistence
        self.apply_persistence_env_overrides_from(env_var)?;

        Ok(())
    }

    /// Backend overrides with an injectable lookup so tests never touch
    /// process environment. Command overrides are split on whitespace.
    fn apply_backend_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("CAP_BACKEND_METRICS_COMMAND") {
            self.backend.metrics_command =
                raw.split_whitespace().map(str::to_string).collect();
        }

        if let Some(raw) = lookup("CAP_BACKEND_ALERTS_COMMAND") {
            self.backend.alerts_command = raw.split_whitespace().map(str::to_string).collect();
        }

        if let Some(raw) = lookup("CAP_BACKEND_METRIC_NAME") {
            self.backend.metric_name = raw;
        }

        if let Some(raw) = lookup("CAP_BACKEND_TIMEOUT_SECS") {
            self.backend.timeout_secs = parse_env_u64("CAP_BACKEND_TIMEOUT_SECS", &raw)?;
        }

        Ok(())
    }

    fn apply_persistence_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("CAP_LOGGING_ENABLED") {
            self.logging.enabled = parse_env_bool("CAP_LOGGING_ENABLED", &raw)?;
        }

        if let Some(raw) = lookup("CAP_HISTORY_ENABLED") {
            self.report.history_enabled = parse_env_bool("CAP_HISTORY_ENABLED", &raw)?;
        }

        if let Some(raw) = lookup("CAP_REPORT_PATH") {
            self.report.path = Some(PathBuf::from(raw));
        }

        // Global opt-out: no JSONL stream, no history rows, no report file.
        if let Some(raw) = lookup("CAP_EPHEMERAL")
            && parse_env_bool("CAP_EPHEMERAL", &raw)?
        {
            self.logging.enabled = false;
            self.report.history_enabled = false;
            self.report.path = None;
        }

        Ok(())
    }

    /// Normalize paths and names for consistent comparison.
    fn normalize_paths(&mut self) {
        self.pool.name = self.pool.name.trim().to_string();

        let s = self.paths.fill_dir.to_string_lossy();
        if s.len() > 1
            && let Some(stripped) = s.strip_suffix('/')
        {
            self.paths.fill_dir = PathBuf::from(stripped);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.name.is_empty() {
            return Err(CapError::invalid_config("pool.name must not be empty"));
        }
        if self.pool.capacity_bytes == Some(0) {
            return Err(CapError::invalid_config("pool.capacity_bytes must be > 0"));
        }

        // Plan-level rules (ordering, fractions, labels) live with the plan.
        let plan = self.fill_plan()?;
        for step in plan.steps() {
            if let Some(alert) = &step.expected_alert {
                if !self.comparison.thresholds.contains_key(alert) {
                    return Err(CapError::invalid_config(format!(
                        "step {:?} expects alert {alert:?} absent from comparison.thresholds",
                        step.label
                    )));
                }
            }
        }

        if self.comparison.thresholds.is_empty() {
            return Err(CapError::invalid_config(
                "comparison.thresholds must define at least one alert",
            ));
        }
        for (id, percent) in &self.comparison.thresholds {
            if id.trim().is_empty() {
                return Err(CapError::invalid_config(
                    "comparison.thresholds keys must not be blank",
                ));
            }
            if !percent.is_finite() || *percent <= 0.0 || *percent > 100.0 {
                return Err(CapError::invalid_config(format!(
                    "comparison.thresholds[{id:?}] must be in (0, 100], got {percent}"
                )));
            }
        }

        let tol = self.comparison.tolerance_percent;
        if !tol.is_finite() || tol <= 0.0 || tol > 100.0 {
            return Err(CapError::invalid_config(format!(
                "comparison.tolerance_percent must be in (0, 100], got {tol}"
            )));
        }
        if self.comparison.tolerance_bytes == Some(0) {
            return Err(CapError::invalid_config(
                "comparison.tolerance_bytes must be > 0 when set",
            ));
        }

        self.polling.policy().validate()?;
        self.fill.options().validate()?;

        if self.backend.metric_name.trim().is_empty() {
            return Err(CapError::invalid_config(
                "backend.metric_name must not be empty",
            ));
        }
        if self.backend.timeout_secs == 0 {
            return Err(CapError::invalid_config(
                "backend.timeout_secs must be > 0",
            ));
        }
        if self.backend.metrics_command.is_empty() != self.backend.alerts_command.is_empty() {
            return Err(CapError::invalid_config(
                "backend.metrics_command and backend.alerts_command must be set together",
            ));
        }

        if self.logging.max_size_bytes == 0 {
            return Err(CapError::invalid_config(
                "logging.max_size_bytes must be > 0",
            ));
        }
        if self.logging.max_rotated_files == 0 {
            return Err(CapError::invalid_config(
                "logging.max_rotated_files must be >= 1",
            ));
        }
        if self.logging.channel_capacity == 0 {
            return Err(CapError::invalid_config(
                "logging.channel_capacity must be >= 1",
            ));
        }

        if self.report.history_enabled && self.report.retention_days == 0 {
            return Err(CapError::invalid_config(
                "report.retention_days must be >= 1 when history is enabled",
            ));
        }

        Ok(())
    }
}

impl PollingConfig {
    /// The poll policy these settings describe.
    #[must_use]
    pub const fn policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            jitter_fraction: self.jitter_fraction,
            max_elapsed: Duration::from_secs(self.max_elapsed_secs),
        }
    }
}

impl FillConfig {
    /// The driver options these settings describe.
    #[must_use]
    pub const fn options(&self) -> FillOptions {
        FillOptions {
            block_size_bytes: self.block_size_bytes,
            queue_depth: self.queue_depth,
            read_write_ratio: self.read_write_ratio,
            rate_limit_bytes_per_sec: self.rate_limit_bytes_per_sec,
            io_pattern: self.io_pattern,
            fsync_every_bytes: self.fsync_every_bytes,
        }
    }
}

impl BackendConfig {
    /// The exec collector settings these describe.
    #[must_use]
    pub fn collector_config(&self) -> ExecCollectorConfig {
        ExecCollectorConfig {
            metrics_command: self.metrics_command.clone(),
            alerts_command: self.alerts_command.clone(),
            metric_name: self.metric_name.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn set_env_f64(name: &str, slot: &mut f64) -> Result<()> {
    if let Some(raw) = env_var(name) {
        *slot = raw.parse::<f64>().map_err(|error| CapError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_env_u64(name: &str, slot: &mut u64) -> Result<()> {
    if let Some(raw) = env_var(name) {
        *slot = parse_env_u64(name, &raw)?;
    }
    Ok(())
}

fn set_env_u32(name: &str, slot: &mut u32) -> Result<()> {
    if let Some(raw) = env_var(name) {
        *slot = raw.parse::<u32>().map_err(|error| CapError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_env_bool(name: &str, slot: &mut bool) -> Result<()> {
    if let Some(raw) = env_var(name) {
        *slot = parse_env_bool(name, &raw)?;
    }
    Ok(())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.parse::<u64>().map_err(|error| CapError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(CapError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: expected true/false, 1/0, or yes/no"),
        }),
    }
}
