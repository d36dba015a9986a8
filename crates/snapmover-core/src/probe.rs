use crate::error::ProbeError;
use crate::platform;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Capacity of the filesystem holding the cache root, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

impl DiskUsage {
    pub fn used_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }

    /// Largest used byte count that still satisfies `threshold`.
    pub fn target_used_bytes(&self, threshold: f64) -> u64 {
        let target = (threshold * self.total_bytes as f64).floor();
        if target <= 0.0 {
            0
        } else {
            (target as u64).min(self.total_bytes)
        }
    }

    /// Bytes that must leave the cache before usage is at or below `threshold`.
    pub fn needed_reclaim_bytes(&self, threshold: f64) -> u64 {
        self.used_bytes
            .saturating_sub(self.target_used_bytes(threshold))
    }

    pub fn is_within(&self, threshold: f64) -> bool {
        self.needed_reclaim_bytes(threshold) == 0
    }

    /// Projected usage after `reclaimed` bytes have left the cache.
    pub fn after_reclaim(&self, reclaimed: u64) -> DiskUsage {
        let reclaimed = reclaimed.min(self.used_bytes);
        DiskUsage {
            total_bytes: self.total_bytes,
            used_bytes: self.used_bytes - reclaimed,
            free_bytes: self.free_bytes.saturating_add(reclaimed),
        }
    }
}

pub trait UsageProbe: Send + Sync {
    fn measure(&self, path: &Path) -> Result<DiskUsage, ProbeError>;
}

/// Reads capacity with `statvfs`.
#[derive(Debug, Clone)]
pub struct StatvfsProbe {
    require_mount_point: bool,
}

impl StatvfsProbe {
    pub fn new(require_mount_point: bool) -> Self {
        Self { require_mount_point }
    }
}

impl Default for StatvfsProbe {
    fn default() -> Self {
        Self::new(true)
    }
}

impl UsageProbe for StatvfsProbe {
    fn measure(&self, path: &Path) -> Result<DiskUsage, ProbeError> {
        let owned = || PathBuf::from(path);
        if !path.exists() {
            return Err(ProbeError::Missing(owned()));
        }
        if !path.is_dir() {
            return Err(ProbeError::NotADirectory(owned()));
        }
        if self.require_mount_point {
            let mounted = platform::is_mount_point(path).map_err(|source| ProbeError::Stat {
                path: owned(),
                source,
            })?;
            if !mounted {
                return Err(ProbeError::NotAMountPoint(owned()));
            }
        }

        let stats = fs4::statvfs(path).map_err(|source| ProbeError::Stat {
            path: owned(),
            source,
        })?;
        let total_bytes = stats.total_space();
        if total_bytes == 0 {
            return Err(ProbeError::ZeroCapacity(owned()));
        }

        let usage = DiskUsage {
            total_bytes,
            used_bytes: total_bytes.saturating_sub(stats.free_space()),
            free_bytes: stats.available_space(),
        };
        trace!("Probed {}: {:?}", path.display(), usage);
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(total: u64, used: u64) -> DiskUsage {
        DiskUsage {
            total_bytes: total,
            used_bytes: used,
            free_bytes: total - used,
        }
    }

    #[test]
    fn test_needed_reclaim_bytes() {
        let u = usage(1000, 800);
        assert_eq!(u.needed_reclaim_bytes(0.5), 300);
        assert!((u.used_fraction() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_needed_reclaim_is_zero_below_threshold() {
        let u = usage(1000, 400);
        assert_eq!(u.needed_reclaim_bytes(0.5), 0);
        assert!(u.is_within(0.5));
        // At exactly the threshold nothing is needed either.
        assert!(usage(1000, 500).is_within(0.5));
    }

    #[test]
    fn test_needed_reclaim_rounds_target_down() {
        // 0.3333 * 1000 floors to a 333 byte target.
        let u = usage(1000, 900);
        assert_eq!(u.needed_reclaim_bytes(0.3333), 567);
    }

    #[test]
    fn test_after_reclaim_saturates() {
        let u = usage(1000, 800).after_reclaim(5000);
        assert_eq!(u.used_bytes, 0);
        assert_eq!(u.total_bytes, 1000);
    }

    #[test]
    fn test_statvfs_probe_on_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let u = StatvfsProbe::new(false).measure(dir.path()).unwrap();
        assert!(u.total_bytes > 0);
        assert!(u.used_bytes <= u.total_bytes);
    }

    #[test]
    fn test_statvfs_probe_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = StatvfsProbe::new(false).measure(&missing).unwrap_err();
        assert!(matches!(err, ProbeError::Missing(_)));
    }

    #[test]
    fn test_statvfs_probe_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let err = StatvfsProbe::new(false).measure(&file).unwrap_err();
        assert!(matches!(err, ProbeError::NotADirectory(_)));
    }
}
