//! Metric and alert observation: collector trait, exposition parsing,
//! exec-backed collection, comparison, alert evaluation.

pub mod alerts;
pub mod backend;
pub mod comparator;
pub mod exec;
pub mod exposition;
