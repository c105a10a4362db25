//! Run history: WAL-mode SQLite store of past validation runs.
//!
//! One row per run plus one row per executed step, so `cap history` can
//! answer "when did this pool last fail and at which step" without parsing
//! JSONL logs.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, params};
use serde::Serialize;

use crate::core::errors::{CapError, Result};
use crate::probe::report::{RunReport, StepOutcome};

/// Run history database handle.
pub struct RunHistoryDb {
    conn: Connection,
    path: PathBuf,
}

impl RunHistoryDb {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CapError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        apply_pragmas(&conn)?;
        apply_schema(&conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a finished run and its steps. Returns the new run id.
    #[allow(clippy::cast_possible_wrap)]
    pub fn insert_run(&mut self, report: &RunReport, config_hash: &str) -> Result<i64> {
        let tx = self.conn.transaction()?;

        tx.prepare_cached(
            "INSERT INTO runs (
                started_at, finished_at, pool, capacity_bytes, tolerance_bytes,
                outcome, error_code, error_message, config_hash
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
        )?
        .execute(params![
            report.started_at,
            report.finished_at,
            report.pool,
            report.capacity_bytes as i64,
            report.tolerance_bytes as i64,
            report.outcome.to_string(),
            report.error_code,
            report.error_message,
            config_hash,
        ])?;
        let run_id = tx.last_insert_rowid();

        for step in &report.steps {
            let outcome = match step.outcome {
                StepOutcome::Passed => "passed",
                StepOutcome::Failed => "failed",
            };
            tx.prepare_cached(
                "INSERT INTO run_steps (
                    run_id, label, target_fraction, expected_bytes, fill_delta_bytes,
                    reported_percent, delta_bytes, attempts, alerts, expected_alert,
                    outcome, error, duration_ms
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            )?
            .execute(params![
                run_id,
                step.label,
                step.target_fraction,
                step.expected_bytes as i64,
                step.fill_delta_bytes as i64,
                step.reported_percent,
                step.delta_bytes,
                step.attempts,
                serde_json::to_string(&step.alerts_firing).ok(),
                step.expected_alert,
                outcome,
                step.error,
                step.duration_ms as i64,
            ])?;
        }

        tx.commit()?;
        Ok(run_id)
    }

    /// Most recent runs, newest first.
    pub fn recent_runs(&self, limit: u32) -> Result<Vec<RunRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, started_at, finished_at, pool, capacity_bytes, tolerance_bytes,
                    outcome, error_code, error_message, config_hash
             FROM runs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(RunRow {
                    id: row.get(0)?,
                    started_at: row.get(1)?,
                    finished_at: row.get(2)?,
                    pool: row.get(3)?,
                    capacity_bytes: row.get(4)?,
                    tolerance_bytes: row.get(5)?,
                    outcome: row.get(6)?,
                    error_code: row.get(7)?,
                    error_message: row.get(8)?,
                    config_hash: row.get(9)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Look up a single run.
    pub fn run_by_id(&self, id: i64) -> Result<Option<RunRow>> {
        let mut rows = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT id, started_at, finished_at, pool, capacity_bytes, tolerance_bytes,
                        outcome, error_code, error_message, config_hash
                 FROM runs WHERE id = ?1",
            )?;
            stmt.query_map(params![id], |row| {
                Ok(RunRow {
                    id: row.get(0)?,
                    started_at: row.get(1)?,
                    finished_at: row.get(2)?,
                    pool: row.get(3)?,
                    capacity_bytes: row.get(4)?,
                    tolerance_bytes: row.get(5)?,
                    outcome: row.get(6)?,
                    error_code: row.get(7)?,
                    error_message: row.get(8)?,
                    config_hash: row.get(9)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
        };
        Ok(rows.pop())
    }

    /// Steps of one run, in execution order.
    pub fn steps_for(&self, run_id: i64) -> Result<Vec<StepRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT run_id, label, target_fraction, expected_bytes, fill_delta_bytes,
                    reported_percent, delta_bytes, attempts, alerts, expected_alert,
                    outcome, error, duration_ms
             FROM run_steps WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(StepRow {
                    run_id: row.get(0)?,
                    label: row.get(1)?,
                    target_fraction: row.get(2)?,
                    expected_bytes: row.get(3)?,
                    fill_delta_bytes: row.get(4)?,
                    reported_percent: row.get(5)?,
                    delta_bytes: row.get(6)?,
                    attempts: row.get(7)?,
                    alerts: row.get(8)?,
                    expected_alert: row.get(9)?,
                    outcome: row.get(10)?,
                    error: row.get(11)?,
                    duration_ms: row.get(12)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete runs (and their steps) older than `retention_days`.
    ///
    /// Returns the number of runs removed.
    pub fn prune_older_than(&self, retention_days: u32) -> Result<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let cutoff_str = cutoff.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        self.conn.execute(
            "DELETE FROM run_steps WHERE run_id IN
                (SELECT id FROM runs WHERE started_at < ?1)",
            params![cutoff_str],
        )?;
        let deleted = self
            .conn
            .execute("DELETE FROM runs WHERE started_at < ?1", params![cutoff_str])?;
        Ok(deleted)
    }

    /// Check that WAL mode is active (for diagnostics).
    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .map(|mode| mode.eq_ignore_ascii_case("wal"))
            .unwrap_or(false)
    }
}

// ──────────────────── row types ────────────────────

/// Row of the `runs` table.
#[derive(Debug, Clone, Serialize)]
pub struct RunRow {
    pub id: i64,
    pub started_at: String,
    pub finished_at: String,
    pub pool: String,
    pub capacity_bytes: i64,
    pub tolerance_bytes: i64,
    pub outcome: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub config_hash: Option<String>,
}

/// Row of the `run_steps` table.
#[derive(Debug, Clone, Serialize)]
pub struct StepRow {
    pub run_id: i64,
    pub label: String,
    pub target_fraction: f64,
    pub expected_bytes: i64,
    pub fill_delta_bytes: i64,
    pub reported_percent: Option<f64>,
    pub delta_bytes: Option<i64>,
    pub attempts: i64,
    pub alerts: Option<String>,
    pub expected_alert: Option<String>,
    pub outcome: String,
    pub error: Option<String>,
    pub duration_ms: i64,
}

// ──────────────────── schema & pragmas ────────────────────

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;
         PRAGMA mmap_size = 67108864;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[CAP-HISTORY] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            pool TEXT NOT NULL,
            capacity_bytes INTEGER NOT NULL,
            tolerance_bytes INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            error_code TEXT,
            error_message TEXT,
            config_hash TEXT
        );

        CREATE TABLE IF NOT EXISTS run_steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL REFERENCES runs(id),
            label TEXT NOT NULL,
            target_fraction REAL NOT NULL,
            expected_bytes INTEGER NOT NULL,
            fill_delta_bytes INTEGER NOT NULL,
            reported_percent REAL,
            delta_bytes INTEGER,
            attempts INTEGER NOT NULL,
            alerts TEXT,
            expected_alert TEXT,
            outcome TEXT NOT NULL,
            error TEXT,
            duration_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
        CREATE INDEX IF NOT EXISTS idx_runs_pool ON runs(pool);
        CREATE INDEX IF NOT EXISTS idx_steps_run ON run_steps(run_id);",
    )?;
    Ok(())
}

// ──────────────────── tests ────────────────────
