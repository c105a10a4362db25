//! Expected-bytes arithmetic and tolerance resolution.

use serde::{Deserialize, Serialize};

use crate::core::errors::{CapError, Result};
use crate::model::plan::FillStep;
use crate::model::pool::ThinPool;

/// Tolerance applied when none is configured, as percent of capacity.
pub const DEFAULT_TOLERANCE_PERCENT: f64 = 2.0;

/// How much disagreement between model and metric is acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceSpec {
    /// Percent of total pool capacity.
    CapacityPercent(f64),
    /// Fixed byte count, independent of capacity.
    Bytes(u64),
}

impl ToleranceSpec {
    fn validate(self) -> Result<()> {
        match self {
            Self::CapacityPercent(pct) if !(pct > 0.0 && pct < 100.0) => {
                Err(CapError::invalid_config(format!(
                    "tolerance percent must be in (0, 100); got {pct}"
                )))
            }
            Self::Bytes(0) => Err(CapError::invalid_config(
                "tolerance bytes must be non-zero",
            )),
            _ => Ok(()),
        }
    }
}

/// Maps fill steps to expected occupied bytes.
///
/// Expectations come from capacity times fraction only. Write history is
/// deliberately not an input: if the driver wrote the wrong amount, the
/// comparison should fail rather than self-justify.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OccupancyModel {
    capacity_bytes: u64,
    tolerance: ToleranceSpec,
}

impl OccupancyModel {
    /// Build a model for `pool` with the given tolerance.
    pub fn new(pool: &ThinPool, tolerance: ToleranceSpec) -> Result<Self> {
        tolerance.validate()?;
        Ok(Self {
            capacity_bytes: pool.total_capacity_bytes(),
            tolerance,
        })
    }

    /// Bytes the pool should hold once `step` settles.
    #[must_use]
    pub fn expected_occupied_bytes(&self, step: &FillStep) -> u64 {
        fraction_of(self.capacity_bytes, step.target_fraction)
    }

    /// Resolved tolerance in bytes.
    #[must_use]
    pub fn tolerance_bytes(&self) -> u64 {
        match self.tolerance {
            ToleranceSpec::CapacityPercent(pct) => fraction_of(self.capacity_bytes, pct / 100.0),
            ToleranceSpec::Bytes(bytes) => bytes,
        }
    }

    /// Pool capacity this model was built from.
    #[must_use]
    pub const fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }
}

/// Round a fractional share of a byte count to whole bytes.
#[must_use]
pub fn fraction_of(capacity_bytes: u64, fraction: f64) -> u64 {
    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    {
        (capacity_bytes as f64 * fraction).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn pool_100g() -> ThinPool {
        ThinPool::new("thin-pool-1", 100 * GIB).unwrap()
    }

    #[test]
    fn expected_bytes_scale_with_fraction() {
        let model = OccupancyModel::new(&pool_100g(), ToleranceSpec::CapacityPercent(2.0)).unwrap();
        let step = FillStep::new("fill-to-70", 0.70, None);
        assert_eq!(model.expected_occupied_bytes(&step), 70 * GIB);
    }

    #[test]
    fn percent_tolerance_resolves_against_capacity() {
        let model = OccupancyModel::new(&pool_100g(), ToleranceSpec::CapacityPercent(2.0)).unwrap();
        assert_eq!(model.tolerance_bytes(), 2 * GIB);
    }

    #[test]
    fn byte_tolerance_passes_through() {
        let model = OccupancyModel::new(&pool_100g(), ToleranceSpec::Bytes(4096)).unwrap();
        assert_eq!(model.tolerance_bytes(), 4096);
    }

    #[test]
    fn rejects_degenerate_tolerances() {
        let pool = pool_100g();
        assert!(OccupancyModel::new(&pool, ToleranceSpec::CapacityPercent(0.0)).is_err());
        assert!(OccupancyModel::new(&pool, ToleranceSpec::CapacityPercent(100.0)).is_err());
        assert!(OccupancyModel::new(&pool, ToleranceSpec::CapacityPercent(-1.0)).is_err());
        assert!(OccupancyModel::new(&pool, ToleranceSpec::Bytes(0)).is_err());
    }

    #[test]
    fn fraction_rounding_is_nearest() {
        assert_eq!(fraction_of(10, 0.26), 3);
        assert_eq!(fraction_of(10, 0.24), 2);
        assert_eq!(fraction_of(0, 0.5), 0);
    }
}
