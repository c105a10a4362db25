//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use capacity_alert_probe::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{CapError, Result};

// Model
pub use crate::model::occupancy::{DEFAULT_TOLERANCE_PERCENT, OccupancyModel, ToleranceSpec};
pub use crate::model::plan::{FillPlan, FillStep};
pub use crate::model::pool::ThinPool;

// Load
pub use crate::load::driver::{FillCompletion, FillOptions, FillRequest, IoPattern, LoadDriver};
pub use crate::load::file_writer::FileLoadDriver;

// Metrics
pub use crate::metrics::alerts::AlertEvaluator;
pub use crate::metrics::backend::{AlertSnapshot, MetricSample, MetricsCollector};
pub use crate::metrics::comparator::CapacityComparator;
pub use crate::metrics::exec::{ExecCollectorConfig, ExecMetricsCollector};

// Probe
pub use crate::probe::cancel::CancelToken;
pub use crate::probe::orchestrator::{
    FillSequenceOrchestrator, ProbePhase, validate_capacity_sequence,
};
pub use crate::probe::poll::PollPolicy;
pub use crate::probe::report::{RunOutcome, RunReport, StepOutcome, StepReport};

// Logging
pub use crate::logger::activity::{ActivityLoggerConfig, ActivityLoggerHandle, spawn_activity_logger};
#[cfg(feature = "sqlite")]
pub use crate::logger::history::RunHistoryDb;
pub use crate::logger::jsonl::JsonlConfig;

// Simulation
pub use crate::sim::{ScriptedCollector, ScriptedLoadDriver, SimulatedPool};
