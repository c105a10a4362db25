//! Activity logging coordinator.
//!
//! A dedicated thread owns the `JsonlWriter`; the orchestrator and CLI send
//! `ProbeEvent`s through a bounded crossbeam channel. Non-blocking `try_send`
//! keeps the fill/poll loop free of logging back-pressure.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{CapError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

/// Default bounded channel capacity for log events.
const CHANNEL_CAPACITY: usize = 256;

/// Events emitted while a validation run executes.
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    RunStarted {
        pool: String,
        capacity_bytes: u64,
        steps: usize,
    },
    FillStarted {
        step: String,
        target_bytes: u64,
    },
    FillCompleted {
        step: String,
        bytes_written: u64,
        duration_ms: u64,
    },
    SettleStarted {
        step: String,
        delay_secs: u64,
    },
    PollAttempt {
        step: String,
        attempt: u32,
    },
    MetricObserved {
        step: String,
        reported_percent: f64,
        expected_bytes: u64,
        actual_bytes: u64,
        delta_bytes: i64,
    },
    AlertsObserved {
        step: String,
        alerts: Vec<String>,
    },
    StepPassed {
        step: String,
        attempts: u32,
    },
    StepFailed {
        step: String,
        code: String,
        message: String,
    },
    RunCompleted {
        pool: String,
        duration_ms: u64,
    },
    RunFailed {
        pool: String,
        code: String,
        message: String,
    },
    /// Sentinel to request graceful shutdown of the logger thread.
    Shutdown,
}

/// Thread-safe, cheaply-cloneable handle for sending log events.
///
/// Wraps a bounded crossbeam `Sender`; `send()` uses `try_send()` so callers
/// are never blocked by logging back-pressure.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ProbeEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Send an event to the logger thread. Non-blocking.
    ///
    /// If the channel is full the event is dropped and the dropped-events
    /// counter is incremented.
    pub fn send(&self, event: ProbeEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    /// Number of events dropped due to channel back-pressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Request graceful shutdown of the logger thread.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ProbeEvent::Shutdown);
    }
}

/// Options for the activity logger.
pub struct ActivityLoggerConfig {
    /// JSONL writer config.
    pub jsonl_config: JsonlConfig,
    /// Bounded channel capacity.
    pub channel_capacity: usize,
}

impl Default for ActivityLoggerConfig {
    fn default() -> Self {
        Self {
            jsonl_config: JsonlConfig::default(),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread and return a handle plus its join handle.
///
/// The handle is `Clone + Send`. The thread runs until `handle.shutdown()` is
/// called or every sender is dropped.
pub fn spawn_activity_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ProbeEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_clone = Arc::clone(&dropped);

    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: dropped,
    };

    let join = thread::Builder::new()
        .name("cap-logger".to_string())
        .spawn(move || {
            logger_thread_main(&rx, config.jsonl_config, &dropped_clone);
        })
        .map_err(|e| CapError::runtime(format!("failed to spawn logger thread: {e}")))?;

    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<ProbeEvent>, jsonl_config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(jsonl_config);

    while let Ok(event) = rx.recv() {
        // Surface back-pressure drops in the log itself.
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            let mut warn = LogEntry::new(EventType::LoggerNotice, Severity::Warning);
            warn.details = Some(format!("{d} log events dropped due to back-pressure"));
            jsonl.append(&warn);
        }

        if matches!(event, ProbeEvent::Shutdown) {
            break;
        }

        jsonl.append(&event_to_log_entry(&event));
    }

    jsonl.flush();
    jsonl.fsync();
}

#[allow(clippy::too_many_lines)]
fn event_to_log_entry(event: &ProbeEvent) -> LogEntry {
    match event {
        ProbeEvent::RunStarted {
            pool,
            capacity_bytes,
            steps,
        } => {
            let mut e = LogEntry::new(EventType::RunStarted, Severity::Info);
            e.pool = Some(pool.clone());
            e.details = Some(format!("capacity={capacity_bytes} steps={steps}"));
            e
        }
        ProbeEvent::FillStarted { step, target_bytes } => {
            let mut e = LogEntry::new(EventType::FillStarted, Severity::Info);
            e.step = Some(step.clone());
            e.target_bytes = Some(*target_bytes);
            e
        }
        ProbeEvent::FillCompleted {
            step,
            bytes_written,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::FillCompleted, Severity::Info);
            e.step = Some(step.clone());
            e.bytes_written = Some(*bytes_written);
            e.duration_ms = Some(*duration_ms);
            e
        }
        ProbeEvent::SettleStarted { step, delay_secs } => {
            let mut e = LogEntry::new(EventType::SettleStarted, Severity::Info);
            e.step = Some(step.clone());
            e.details = Some(format!("delay={delay_secs}s"));
            e
        }
        ProbeEvent::PollAttempt { step, attempt } => {
            let mut e = LogEntry::new(EventType::PollAttempt, Severity::Info);
            e.step = Some(step.clone());
            e.attempt = Some(*attempt);
            e
        }
        ProbeEvent::MetricObserved {
            step,
            reported_percent,
            expected_bytes,
            actual_bytes,
            delta_bytes,
        } => {
            let mut e = LogEntry::new(EventType::MetricObserved, Severity::Info);
            e.step = Some(step.clone());
            e.reported_percent = Some(*reported_percent);
            e.expected_bytes = Some(*expected_bytes);
            e.actual_bytes = Some(*actual_bytes);
            e.delta_bytes = Some(*delta_bytes);
            e
        }
        ProbeEvent::AlertsObserved { step, alerts } => {
            let mut e = LogEntry::new(EventType::AlertsObserved, Severity::Info);
            e.step = Some(step.clone());
            e.alerts = Some(alerts.clone());
            e
        }
        ProbeEvent::StepPassed { step, attempts } => {
            let mut e = LogEntry::new(EventType::StepPassed, Severity::Info);
            e.step = Some(step.clone());
            e.attempt = Some(*attempts);
            e.outcome = Some("passed".to_string());
            e
        }
        ProbeEvent::StepFailed {
            step,
            code,
            message,
        } => {
            let mut e = LogEntry::new(EventType::StepFailed, Severity::Critical);
            e.step = Some(step.clone());
            e.outcome = Some("failed".to_string());
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ProbeEvent::RunCompleted { pool, duration_ms } => {
            let mut e = LogEntry::new(EventType::RunCompleted, Severity::Info);
            e.pool = Some(pool.clone());
            e.outcome = Some("passed".to_string());
            e.duration_ms = Some(*duration_ms);
            e
        }
        ProbeEvent::RunFailed {
            pool,
            code,
            message,
        } => {
            let mut e = LogEntry::new(EventType::RunFailed, Severity::Critical);
            e.pool = Some(pool.clone());
            e.outcome = Some("failed".to_string());
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ProbeEvent::Shutdown => {
            // Should not reach here; handled by the thread loop.
            LogEntry::new(EventType::LoggerNotice, Severity::Info)
        }
    }
}

// ──────────────────── tests ────────────────────
