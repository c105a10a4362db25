#![forbid(unsafe_code)]

//! Capacity Alert Probe (cap) — validates that thin-pool capacity alerting
//! actually works before production depends on it.
//!
//! A probe run drives a pool through an ordered sequence of fill steps and,
//! after each one, checks two things against live observations:
//! 1. **Occupancy** — the reported fill-percent metric matches the bytes the
//!    pool must now contain, within a configured tolerance
//! 2. **Alerts** — threshold alerts are absent below their line and firing
//!    above it, at the exact steps the plan predicts
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use capacity_alert_probe::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use capacity_alert_probe::core::config::Config;
//! use capacity_alert_probe::probe::orchestrator::validate_capacity_sequence;
//! ```

pub mod prelude;

pub mod core;
pub mod load;
pub mod logger;
pub mod metrics;
pub mod model;
pub mod probe;
pub mod sim;

#[cfg(test)]
mod sequence_tests;
