//! Fill-sequence orchestration: stepping, polling, verdicts, reporting.

pub mod cancel;
pub mod orchestrator;
pub mod poll;
pub mod report;
