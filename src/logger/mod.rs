//! Structured logging: JSONL activity stream plus SQLite run history.

pub mod activity;
#[cfg(feature = "sqlite")]
pub mod history;
pub mod jsonl;
