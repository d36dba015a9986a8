mod rsync;

pub use rsync::RsyncTransfer;

use crate::error::MoveError;
use crate::scanner::{CacheFile, Fingerprint};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// One file to relocate from the cache into the backing pool, keeping its
/// relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    pub cache_root: PathBuf,
    pub backing_root: PathBuf,
    pub relative_path: PathBuf,
    /// Fingerprint recorded when the file was classified.
    pub expected: Fingerprint,
}

impl MoveRequest {
    pub fn source(&self) -> PathBuf {
        self.cache_root.join(&self.relative_path)
    }

    pub fn destination(&self) -> PathBuf {
        self.backing_root.join(&self.relative_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The source disappeared after classification.
    Vanished,
    /// The source was modified after classification.
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved { bytes: u64 },
    Skipped(SkipReason),
}

pub type MoveResult = Result<MoveOutcome, MoveError>;

/// Copies a file with its attributes, verifies the copy and only then removes
/// the source. A failure at any step before removal must leave the source intact.
pub trait Transfer: Send + Sync {
    fn copy_verify_delete(&self, request: &MoveRequest) -> MoveResult;
}

/// Runs the per-file pre-checks and hands the actual work to a [`Transfer`].
#[derive(Clone)]
pub struct Mover {
    cache_root: PathBuf,
    backing_root: PathBuf,
    transfer: Arc<dyn Transfer>,
}

impl Mover {
    pub fn new(cache_root: &Path, backing_root: &Path, transfer: Arc<dyn Transfer>) -> Self {
        Self {
            cache_root: cache_root.to_path_buf(),
            backing_root: backing_root.to_path_buf(),
            transfer,
        }
    }

    pub fn request_for(&self, file: &CacheFile) -> MoveRequest {
        MoveRequest {
            cache_root: self.cache_root.clone(),
            backing_root: self.backing_root.clone(),
            relative_path: file.relative_path.clone(),
            expected: file.fingerprint,
        }
    }

    pub fn move_file(&self, file: &CacheFile) -> MoveResult {
        let request = self.request_for(file);
        let source = request.source();

        let metadata = match fs::symlink_metadata(&source) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("{} vanished before it could be moved", source.display());
                return Ok(MoveOutcome::Skipped(SkipReason::Vanished));
            }
            Err(err) => {
                return Err(MoveError::Transfer {
                    path: file.relative_path.clone(),
                    reason: format!("cannot stat source: {}", err),
                })
            }
        };
        if !metadata.is_file() {
            debug!("{} is no longer a regular file", source.display());
            return Ok(MoveOutcome::Skipped(SkipReason::Vanished));
        }
        if Fingerprint::from_metadata(&metadata) != file.fingerprint {
            debug!("{} changed since it was classified", source.display());
            return Ok(MoveOutcome::Skipped(SkipReason::Changed));
        }

        self.transfer.copy_verify_delete(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransfer {
        seen: Mutex<Vec<PathBuf>>,
    }

    impl Transfer for RecordingTransfer {
        fn copy_verify_delete(&self, request: &MoveRequest) -> MoveResult {
            self.seen.lock().unwrap().push(request.relative_path.clone());
            Ok(MoveOutcome::Moved {
                bytes: request.expected.size,
            })
        }
    }

    fn cache_file(root: &Path, relative: &str, data: &[u8]) -> CacheFile {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, data).unwrap();
        CacheFile::from_metadata(PathBuf::from(relative), &fs::metadata(&path).unwrap())
    }

    #[test]
    fn test_request_paths() {
        let request = MoveRequest {
            cache_root: PathBuf::from("/cache"),
            backing_root: PathBuf::from("/backing"),
            relative_path: PathBuf::from("a/b.txt"),
            expected: Fingerprint {
                size: 0,
                modified_secs: 0,
                modified_nanos: 0,
            },
        };
        assert_eq!(request.source(), PathBuf::from("/cache/a/b.txt"));
        assert_eq!(request.destination(), PathBuf::from("/backing/a/b.txt"));
    }

    #[test]
    fn test_vanished_source_is_skipped() {
        let cache = tempfile::tempdir().unwrap();
        let backing = tempfile::tempdir().unwrap();
        let file = cache_file(cache.path(), "gone.bin", b"data");
        fs::remove_file(cache.path().join("gone.bin")).unwrap();

        let transfer = Arc::new(RecordingTransfer::default());
        let mover = Mover::new(cache.path(), backing.path(), transfer.clone());
        assert_eq!(
            mover.move_file(&file).unwrap(),
            MoveOutcome::Skipped(SkipReason::Vanished)
        );
        assert!(transfer.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_changed_source_is_skipped() {
        let cache = tempfile::tempdir().unwrap();
        let backing = tempfile::tempdir().unwrap();
        let file = cache_file(cache.path(), "grow.bin", b"data");
        fs::write(cache.path().join("grow.bin"), b"much more data").unwrap();

        let mover = Mover::new(cache.path(), backing.path(), Arc::new(RecordingTransfer::default()));
        assert_eq!(
            mover.move_file(&file).unwrap(),
            MoveOutcome::Skipped(SkipReason::Changed)
        );
    }

    #[test]
    fn test_unchanged_source_is_handed_to_transfer() {
        let cache = tempfile::tempdir().unwrap();
        let backing = tempfile::tempdir().unwrap();
        let file = cache_file(cache.path(), "dir/keep.bin", b"12345");

        let transfer = Arc::new(RecordingTransfer::default());
        let mover = Mover::new(cache.path(), backing.path(), transfer.clone());
        assert_eq!(mover.move_file(&file).unwrap(), MoveOutcome::Moved { bytes: 5 });
        assert_eq!(
            *transfer.seen.lock().unwrap(),
            vec![PathBuf::from("dir/keep.bin")]
        );
    }
}
