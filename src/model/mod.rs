//! Occupancy model: pool identity, fill plans, expected-bytes arithmetic.

pub mod occupancy;
pub mod plan;
pub mod pool;
