//! In-memory pool simulation and scripted test doubles.
//!
//! `SimulatedPool` models an honest thin pool: bytes written through its
//! driver show up in its metric, and threshold alerts fire exactly when the
//! fill percentage crosses them. The `Scripted*` doubles let tests and demos
//! misbehave on purpose (wrong metric, flapping backend, failed fills).

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::errors::{CapError, Result};
use crate::load::driver::{FillCompletion, FillRequest, LoadDriver};
use crate::metrics::alerts::{TP_DATA_75_PERCENT, TP_DATA_85_PERCENT};
use crate::metrics::backend::{AlertSnapshot, MetricSample, MetricsCollector};
use crate::model::pool::ThinPool;

/// Metric series name the simulation reports under.
pub const SIM_METRIC_NAME: &str = crate::metrics::exposition::DEFAULT_METRIC_NAME;

struct SimState {
    pool_name: String,
    capacity_bytes: u64,
    occupied: AtomicU64,
    thresholds: BTreeMap<String, f64>,
    metric_calls: AtomicUsize,
    alert_calls: AtomicUsize,
}

impl SimState {
    #[allow(clippy::cast_precision_loss)]
    fn percent(&self) -> f64 {
        let occupied = self.occupied.load(Ordering::SeqCst);
        occupied as f64 / self.capacity_bytes as f64 * 100.0
    }
}

/// An honest in-memory thin pool.
#[derive(Clone)]
pub struct SimulatedPool {
    state: Arc<SimState>,
}

impl SimulatedPool {
    /// Pool with the default 75% / 85% threshold alerts.
    #[must_use]
    pub fn new(name: &str, capacity_bytes: u64) -> Self {
        let mut thresholds = BTreeMap::new();
        thresholds.insert(TP_DATA_75_PERCENT.to_string(), 75.0);
        thresholds.insert(TP_DATA_85_PERCENT.to_string(), 85.0);
        Self::with_thresholds(name, capacity_bytes, thresholds)
    }

    /// Pool with a custom alert threshold table.
    #[must_use]
    pub fn with_thresholds(
        name: &str,
        capacity_bytes: u64,
        thresholds: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            state: Arc::new(SimState {
                pool_name: name.to_string(),
                capacity_bytes,
                occupied: AtomicU64::new(0),
                thresholds,
                metric_calls: AtomicUsize::new(0),
                alert_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// The pool's identity as the orchestrator sees it.
    pub fn thin_pool(&self) -> Result<ThinPool> {
        ThinPool::new(&self.state.pool_name, self.state.capacity_bytes)
    }

    /// Driver that writes into this pool.
    #[must_use]
    pub fn driver(&self) -> SimLoadDriver {
        SimLoadDriver {
            state: Arc::clone(&self.state),
        }
    }

    /// Collector that reads this pool's metric and alert state.
    #[must_use]
    pub fn collector(&self) -> SimCollector {
        SimCollector {
            state: Arc::clone(&self.state),
        }
    }

    /// Bytes currently occupied.
    #[must_use]
    pub fn occupied_bytes(&self) -> u64 {
        self.state.occupied.load(Ordering::SeqCst)
    }

    /// Current fill percentage.
    #[must_use]
    pub fn percent(&self) -> f64 {
        self.state.percent()
    }

    /// Metric fetches served so far.
    #[must_use]
    pub fn metric_calls(&self) -> usize {
        self.state.metric_calls.load(Ordering::SeqCst)
    }

    /// Alert fetches served so far.
    #[must_use]
    pub fn alert_calls(&self) -> usize {
        self.state.alert_calls.load(Ordering::SeqCst)
    }
}

/// Driver half of [`SimulatedPool`].
pub struct SimLoadDriver {
    state: Arc<SimState>,
}

impl LoadDriver for SimLoadDriver {
    fn fill(&self, request: &FillRequest) -> Result<FillCompletion> {
        request.options.validate()?;
        let started = Instant::now();
        let state = &self.state;
        let occupied = state.occupied.load(Ordering::SeqCst);
        let target = occupied.saturating_add(request.target_bytes);
        if target > state.capacity_bytes {
            return Err(CapError::load_failed(
                &request.label,
                format!(
                    "pool full: {target} of {} bytes requested",
                    state.capacity_bytes
                ),
            ));
        }
        state.occupied.store(target, Ordering::SeqCst);
        Ok(FillCompletion {
            bytes_written: request.target_bytes,
            duration: started.elapsed(),
        })
    }
}

/// Collector half of [`SimulatedPool`].
pub struct SimCollector {
    state: Arc<SimState>,
}

impl MetricsCollector for SimCollector {
    fn fetch_percent_metric(&self, pool: &str) -> Result<MetricSample> {
        self.state.metric_calls.fetch_add(1, Ordering::SeqCst);
        if pool != self.state.pool_name {
            return Err(CapError::metric_unavailable(format!(
                "no series for pool {pool:?}"
            )));
        }
        Ok(MetricSample::now(SIM_METRIC_NAME, self.state.percent()))
    }

    fn fetch_alerts(&self) -> Result<AlertSnapshot> {
        self.state.alert_calls.fetch_add(1, Ordering::SeqCst);
        let percent = self.state.percent();
        let firing = self
            .state
            .thresholds
            .iter()
            .filter(|(_, threshold)| percent >= **threshold)
            .map(|(id, _)| id.clone());
        Ok(AlertSnapshot::new(firing))
    }
}

// ──────────────────── scripted doubles ────────────────────

/// One scripted answer to a metric fetch.
#[derive(Debug, Clone)]
pub enum MetricReply {
    /// Report this fill percentage.
    Percent(f64),
    /// Fail the fetch as transient.
    Unavailable(String),
}

/// One scripted answer to an alert fetch.
#[derive(Debug, Clone)]
pub enum AlertReply {
    /// These alert ids are firing.
    Firing(Vec<String>),
    /// Fail the fetch as transient.
    Unreachable(String),
}

/// Collector that replays scripted replies.
///
/// Replies are consumed front to back; the final reply repeats forever so a
/// script can end in a steady state. An empty script always fails.
#[derive(Default)]
pub struct ScriptedCollector {
    metrics: Mutex<VecDeque<MetricReply>>,
    alerts: Mutex<VecDeque<AlertReply>>,
    metric_calls: AtomicUsize,
    alert_calls: AtomicUsize,
}

impl ScriptedCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful metric reading.
    pub fn push_percent(&self, value: f64) {
        self.metrics.lock().push_back(MetricReply::Percent(value));
    }

    /// Queue a transient metric failure.
    pub fn push_metric_unavailable(&self, details: &str) {
        self.metrics
            .lock()
            .push_back(MetricReply::Unavailable(details.to_string()));
    }

    /// Queue an alert snapshot.
    pub fn push_alerts(&self, ids: &[&str]) {
        self.alerts
            .lock()
            .push_back(AlertReply::Firing(ids.iter().map(ToString::to_string).collect()));
    }

    /// Queue a transient alert-backend failure.
    pub fn push_alerts_unreachable(&self, details: &str) {
        self.alerts
            .lock()
            .push_back(AlertReply::Unreachable(details.to_string()));
    }

    /// Metric fetches served so far.
    pub fn metric_calls(&self) -> usize {
        self.metric_calls.load(Ordering::SeqCst)
    }

    /// Alert fetches served so far.
    pub fn alert_calls(&self) -> usize {
        self.alert_calls.load(Ordering::SeqCst)
    }
}

fn next_reply<T: Clone>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut q = queue.lock();
    if q.len() > 1 {
        q.pop_front()
    } else {
        q.front().cloned()
    }
}

impl MetricsCollector for ScriptedCollector {
    fn fetch_percent_metric(&self, _pool: &str) -> Result<MetricSample> {
        self.metric_calls.fetch_add(1, Ordering::SeqCst);
        match next_reply(&self.metrics) {
            Some(MetricReply::Percent(value)) => Ok(MetricSample::now(SIM_METRIC_NAME, value)),
            Some(MetricReply::Unavailable(details)) => {
                Err(CapError::metric_unavailable(details))
            }
            None => Err(CapError::metric_unavailable("metric script exhausted")),
        }
    }

    fn fetch_alerts(&self) -> Result<AlertSnapshot> {
        self.alert_calls.fetch_add(1, Ordering::SeqCst);
        match next_reply(&self.alerts) {
            Some(AlertReply::Firing(ids)) => Ok(AlertSnapshot::new(ids)),
            Some(AlertReply::Unreachable(details)) => Err(CapError::alert_backend(details)),
            None => Err(CapError::alert_backend("alert script exhausted")),
        }
    }
}

/// Driver that records fill requests and can fail on demand.
#[derive(Default)]
pub struct ScriptedLoadDriver {
    requests: Mutex<Vec<FillRequest>>,
    fail_next: Mutex<Option<String>>,
    pace: Mutex<Option<Duration>>,
}

impl ScriptedLoadDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next fill fail with this message.
    pub fn fail_next(&self, details: &str) {
        *self.fail_next.lock() = Some(details.to_string());
    }

    /// Make every fill take at least this long (for cancellation tests).
    pub fn pace(&self, duration: Duration) {
        *self.pace.lock() = Some(duration);
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<FillRequest> {
        self.requests.lock().clone()
    }

    /// Number of fills attempted.
    pub fn fill_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl LoadDriver for ScriptedLoadDriver {
    fn fill(&self, request: &FillRequest) -> Result<FillCompletion> {
        self.requests.lock().push(request.clone());
        if let Some(pause) = *self.pace.lock() {
            std::thread::sleep(pause);
        }
        if let Some(details) = self.fail_next.lock().take() {
            return Err(CapError::load_failed(&request.label, details));
        }
        Ok(FillCompletion {
            bytes_written: request.target_bytes,
            duration: Duration::ZERO,
        })
    }
}
