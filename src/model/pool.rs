//! Identity and geometry of the thin pool under test.

use serde::{Deserialize, Serialize};

use crate::core::errors::{CapError, Result};

/// Default overprovision ratio reported by LVM-backed thin pools.
pub const DEFAULT_OVERPROVISION_RATIO: f64 = 10.0;

/// Default share of the volume group the thin pool occupies, in percent.
pub const DEFAULT_SIZE_PERCENT: f64 = 90.0;

/// A thin-provisioned pool: a name, a data capacity, and the provisioning
/// metadata the storage layer reports alongside it.
///
/// Capacity is the single source of truth for every expected-bytes
/// computation; nothing in the probe derives expectations from write history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinPool {
    name: String,
    total_capacity_bytes: u64,
    overprovision_ratio: f64,
    size_percent: f64,
}

impl ThinPool {
    /// Build a pool description with default provisioning metadata.
    pub fn new(name: impl Into<String>, total_capacity_bytes: u64) -> Result<Self> {
        Self::with_provisioning(
            name,
            total_capacity_bytes,
            DEFAULT_OVERPROVISION_RATIO,
            DEFAULT_SIZE_PERCENT,
        )
    }

    /// Build a pool description with explicit provisioning metadata.
    pub fn with_provisioning(
        name: impl Into<String>,
        total_capacity_bytes: u64,
        overprovision_ratio: f64,
        size_percent: f64,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CapError::invalid_config("pool name must not be empty"));
        }
        if total_capacity_bytes == 0 {
            return Err(CapError::invalid_config(format!(
                "pool {name:?} must have a non-zero capacity"
            )));
        }
        if overprovision_ratio <= 0.0 || !overprovision_ratio.is_finite() {
            return Err(CapError::invalid_config(format!(
                "overprovision ratio must be positive and finite; got {overprovision_ratio}"
            )));
        }
        if !(0.0..=100.0).contains(&size_percent) || size_percent == 0.0 {
            return Err(CapError::invalid_config(format!(
                "size percent must be in (0, 100]; got {size_percent}"
            )));
        }
        Ok(Self {
            name,
            total_capacity_bytes,
            overprovision_ratio,
            size_percent,
        })
    }

    /// Discover capacity from the filesystem mounted at `path`.
    ///
    /// Uses the total block count of the backing filesystem, which for a
    /// dedicated thin-volume mount equals the provisioned data size.
    #[cfg(unix)]
    pub fn from_mount(name: impl Into<String>, path: &std::path::Path) -> Result<Self> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|error| CapError::io(path, std::io::Error::other(error.to_string())))?;
        let total = stat.blocks().saturating_mul(stat.fragment_size());
        Self::new(name, total)
    }

    /// Pool name used to select the metric series.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total data capacity in bytes.
    #[must_use]
    pub const fn total_capacity_bytes(&self) -> u64 {
        self.total_capacity_bytes
    }

    /// Configured overprovision ratio.
    #[must_use]
    pub const fn overprovision_ratio(&self) -> f64 {
        self.overprovision_ratio
    }

    /// Share of the volume group the pool occupies, in percent.
    #[must_use]
    pub const fn size_percent(&self) -> f64 {
        self.size_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn construction_defaults_provisioning_metadata() {
        let pool = ThinPool::new("thin-pool-1", 100 * GIB).unwrap();
        assert_eq!(pool.name(), "thin-pool-1");
        assert_eq!(pool.total_capacity_bytes(), 100 * GIB);
        assert!((pool.overprovision_ratio() - DEFAULT_OVERPROVISION_RATIO).abs() < f64::EPSILON);
        assert!((pool.size_percent() - DEFAULT_SIZE_PERCENT).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_empty_name() {
        let err = ThinPool::new("  ", GIB).expect_err("blank name must fail");
        assert_eq!(err.code(), "CAP-1001");
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = ThinPool::new("thin-pool-1", 0).expect_err("zero capacity must fail");
        assert_eq!(err.code(), "CAP-1001");
    }

    #[test]
    fn rejects_bad_provisioning_metadata() {
        assert!(ThinPool::with_provisioning("p", GIB, 0.0, 90.0).is_err());
        assert!(ThinPool::with_provisioning("p", GIB, f64::NAN, 90.0).is_err());
        assert!(ThinPool::with_provisioning("p", GIB, 10.0, 0.0).is_err());
        assert!(ThinPool::with_provisioning("p", GIB, 10.0, 120.0).is_err());
        assert!(ThinPool::with_provisioning("p", GIB, 10.0, 90.0).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn from_mount_reports_nonzero_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ThinPool::from_mount("scratch", dir.path()).unwrap();
        assert!(pool.total_capacity_bytes() > 0);
    }
}
