#![allow(dead_code)]

use snapmover_core::{
    DiskUsage, MoveError, MoveOutcome, MoveRequest, MoveResult, ProbeError, Transfer, UsageProbe,
};
use std::collections::VecDeque;
use std::fs::{self, FileTimes};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn usage(total: u64, used: u64) -> DiskUsage {
    DiskUsage {
        total_bytes: total,
        used_bytes: used,
        free_bytes: total - used,
    }
}

/// Returns queued readings in order, repeating the last one.
pub struct ScriptedProbe {
    readings: Mutex<VecDeque<Result<DiskUsage, ()>>>,
    calls: Mutex<usize>,
}

impl ScriptedProbe {
    pub fn fixed(total: u64, used: u64) -> Self {
        Self::sequence(vec![usage(total, used)])
    }

    pub fn sequence(readings: Vec<DiskUsage>) -> Self {
        Self {
            readings: Mutex::new(readings.into_iter().map(Ok).collect()),
            calls: Mutex::new(0),
        }
    }

    /// One good reading, then every later measurement fails.
    pub fn then_failing(total: u64, used: u64) -> Self {
        Self {
            readings: Mutex::new(VecDeque::from(vec![Ok(usage(total, used)), Err(())])),
            calls: Mutex::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            readings: Mutex::new(VecDeque::from(vec![Err(())])),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl UsageProbe for ScriptedProbe {
    fn measure(&self, path: &Path) -> Result<DiskUsage, ProbeError> {
        *self.calls.lock().unwrap() += 1;
        let mut readings = self.readings.lock().unwrap();
        let reading = if readings.len() > 1 {
            readings.pop_front().unwrap()
        } else {
            *readings.front().unwrap()
        };
        reading.map_err(|_| ProbeError::NotAMountPoint(path.to_path_buf()))
    }
}

/// Moves files with plain std::fs calls.
#[derive(Default)]
pub struct LocalTransfer {
    /// Relative paths that fail to copy.
    pub fail_copy: Vec<PathBuf>,
    /// Relative paths whose source cannot be removed.
    pub fail_delete: Vec<PathBuf>,
    pub attempts: Mutex<Vec<PathBuf>>,
}

impl Transfer for LocalTransfer {
    fn copy_verify_delete(&self, request: &MoveRequest) -> MoveResult {
        self.attempts
            .lock()
            .unwrap()
            .push(request.relative_path.clone());

        if self.fail_copy.contains(&request.relative_path) {
            return Err(MoveError::Transfer {
                path: request.relative_path.clone(),
                reason: "simulated copy failure".to_string(),
            });
        }

        let destination = request.destination();
        fs::create_dir_all(destination.parent().unwrap()).unwrap();
        let bytes = fs::copy(request.source(), &destination).map_err(|e| MoveError::Transfer {
            path: request.relative_path.clone(),
            reason: e.to_string(),
        })?;

        if self.fail_delete.contains(&request.relative_path) {
            return Err(MoveError::SourceDelete {
                path: request.relative_path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        fs::remove_file(request.source()).unwrap();
        Ok(MoveOutcome::Moved { bytes })
    }
}

pub fn epoch(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// Create `root/relative` with `size` bytes and the given access time.
pub fn write_file(root: &Path, relative: &str, size: usize, accessed_secs: u64) -> PathBuf {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, vec![0x5Au8; size]).unwrap();
    let file = fs::File::options().write(true).open(&path).unwrap();
    file.set_times(
        FileTimes::new()
            .set_accessed(epoch(accessed_secs))
            .set_modified(epoch(1_600_000_000)),
    )
    .unwrap();
    path
}

/// Copy a live cache file into snapshot `name` (snapper layout) with the same
/// size and modification time, so the snapshot pins it.
pub fn snapshot_file(cache_root: &Path, name: &str, relative: &str) {
    let source = cache_root.join(relative);
    let target = cache_root
        .join(".snapshots")
        .join(name)
        .join("snapshot")
        .join(relative);
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    let before = fs::metadata(&source).unwrap();
    fs::copy(&source, &target).unwrap();
    let modified = before.modified().unwrap();
    fs::File::options()
        .write(true)
        .open(&target)
        .unwrap()
        .set_modified(modified)
        .unwrap();
    // Reading the source for the copy may have bumped its atime.
    fs::File::options()
        .write(true)
        .open(&source)
        .unwrap()
        .set_times(
            FileTimes::new()
                .set_accessed(before.accessed().unwrap())
                .set_modified(modified),
        )
        .unwrap();
}

/// Create an empty snapshot in snapper layout.
pub fn empty_snapshot(cache_root: &Path, name: &str) {
    fs::create_dir_all(cache_root.join(".snapshots").join(name).join("snapshot")).unwrap();
}
