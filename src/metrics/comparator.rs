//! Pure comparison of reported occupancy against the model.

use serde::Serialize;

use crate::metrics::backend::MetricSample;
use crate::model::occupancy::fraction_of;

/// Result of one expected-vs-reported comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComparisonOutcome {
    /// Whether `|delta_bytes| <= tolerance_bytes`.
    pub within_tolerance: bool,
    /// Model-derived expected occupied bytes.
    pub expected_bytes: u64,
    /// Bytes implied by the reported percent.
    pub actual_bytes: u64,
    /// Signed `actual - expected`.
    pub delta_bytes: i64,
    /// Raw percent value the sample carried.
    pub reported_percent: f64,
}

impl ComparisonOutcome {
    /// Absolute disagreement in bytes.
    #[must_use]
    pub const fn abs_delta_bytes(&self) -> u64 {
        self.delta_bytes.unsigned_abs()
    }
}

/// Converts percent samples to bytes and checks them against expectations.
///
/// Pure and deterministic: no I/O, no clock. Identical inputs always produce
/// identical outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityComparator {
    capacity_bytes: u64,
}

impl CapacityComparator {
    /// Comparator for a pool of `capacity_bytes`.
    #[must_use]
    pub const fn new(capacity_bytes: u64) -> Self {
        Self { capacity_bytes }
    }

    /// Compare a metric sample against the expected occupied bytes.
    #[must_use]
    pub fn compare(
        &self,
        expected_bytes: u64,
        sample: &MetricSample,
        tolerance_bytes: u64,
    ) -> ComparisonOutcome {
        let actual_bytes = fraction_of(self.capacity_bytes, sample.value / 100.0);
        #[allow(clippy::cast_possible_wrap)]
        let delta_bytes = actual_bytes as i64 - expected_bytes as i64;
        ComparisonOutcome {
            within_tolerance: delta_bytes.unsigned_abs() <= tolerance_bytes,
            expected_bytes,
            actual_bytes,
            delta_bytes,
            reported_percent: sample.value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn sample(pct: f64) -> MetricSample {
        MetricSample::now("topolvm_thinpool_data_percent", pct)
    }

    #[test]
    fn within_tolerance_when_reported_close() {
        // 100 GiB pool, expected 70%, reported 69.5%, tolerance 2% of capacity.
        let comparator = CapacityComparator::new(100 * GIB);
        let outcome = comparator.compare(70 * GIB, &sample(69.5), 2 * GIB);
        assert!(outcome.within_tolerance);
        assert!(outcome.delta_bytes < 0);
        assert_eq!(outcome.abs_delta_bytes(), GIB / 2);
    }

    #[test]
    fn outside_tolerance_when_reported_far() {
        let comparator = CapacityComparator::new(100 * GIB);
        let outcome = comparator.compare(76 * GIB, &sample(95.0), 2 * GIB);
        assert!(!outcome.within_tolerance);
        assert_eq!(outcome.actual_bytes, 95 * GIB);
        assert_eq!(outcome.delta_bytes, 19 * GIB as i64);
    }

    #[test]
    fn boundary_delta_counts_as_within() {
        let comparator = CapacityComparator::new(100 * GIB);
        // Reported exactly tolerance away from expected.
        let outcome = comparator.compare(70 * GIB, &sample(72.0), 2 * GIB);
        assert_eq!(outcome.abs_delta_bytes(), 2 * GIB);
        assert!(outcome.within_tolerance);
    }

    #[test]
    fn comparison_is_idempotent() {
        let comparator = CapacityComparator::new(100 * GIB);
        let s = sample(76.2);
        let first = comparator.compare(76 * GIB, &s, 2 * GIB);
        let second = comparator.compare(76 * GIB, &s, 2 * GIB);
        assert_eq!(first, second);
    }

    #[test]
    fn negative_percent_clamps_to_zero_bytes() {
        let comparator = CapacityComparator::new(100 * GIB);
        let outcome = comparator.compare(GIB, &sample(-5.0), GIB / 2);
        assert_eq!(outcome.actual_bytes, 0);
        assert!(!outcome.within_tolerance);
    }
}
