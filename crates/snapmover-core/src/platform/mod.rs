use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Device id of the filesystem holding `path`, where the platform exposes one.
#[cfg(unix)]
pub fn device_id(path: &Path) -> io::Result<Option<u64>> {
    use std::os::unix::fs::MetadataExt;
    Ok(Some(std::fs::metadata(path)?.dev()))
}

#[cfg(not(unix))]
pub fn device_id(path: &Path) -> io::Result<Option<u64>> {
    std::fs::metadata(path)?;
    Ok(None)
}

/// A directory is a mount point when it lives on a different device than its
/// parent, or has no parent at all.
pub fn is_mount_point(path: &Path) -> io::Result<bool> {
    let canonical = std::fs::canonicalize(path)?;
    let parent = match canonical.parent() {
        Some(parent) => parent,
        None => return Ok(true),
    };

    match (device_id(&canonical)?, device_id(parent)?) {
        (Some(own), Some(parent_dev)) => Ok(own != parent_dev),
        // No device ids to compare; assume the caller knows what it is doing.
        _ => Ok(true),
    }
}

/// Whole seconds and nanoseconds since the epoch. Pre-epoch times are negative.
pub fn split_timestamp(time: SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => {
            let d = e.duration();
            if d.subsec_nanos() == 0 {
                (-(d.as_secs() as i64), 0)
            } else {
                (-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
            }
        }
    }
}

/// Last access time in seconds, falling back to mtime where atime is not kept.
pub fn last_access_secs(metadata: &Metadata) -> i64 {
    metadata
        .accessed()
        .or_else(|_| metadata.modified())
        .map(|t| split_timestamp(t).0)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_split_timestamp_after_epoch() {
        let t = UNIX_EPOCH + Duration::new(1_700_000_000, 250);
        assert_eq!(split_timestamp(t), (1_700_000_000, 250));
    }

    #[test]
    fn test_split_timestamp_before_epoch() {
        let t = UNIX_EPOCH - Duration::new(1, 500_000_000);
        assert_eq!(split_timestamp(t), (-2, 500_000_000));
    }

    #[test]
    fn test_root_is_mount_point() {
        assert!(is_mount_point(Path::new("/")).unwrap());
    }
}
