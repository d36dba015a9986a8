mod walk;

pub use walk::{scan_cache, walk_tree, WalkOptions, WalkOutput};

use crate::platform;
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::PathBuf;

/// Cheap identity signal used to decide whether a snapshot copy still holds
/// the same content as a live file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub modified_secs: i64,
    pub modified_nanos: u32,
}

impl Fingerprint {
    pub fn from_metadata(metadata: &Metadata) -> Fingerprint {
        let (modified_secs, modified_nanos) = metadata
            .modified()
            .map(platform::split_timestamp)
            .unwrap_or((0, 0));
        Fingerprint {
            size: metadata.len(),
            modified_secs,
            modified_nanos,
        }
    }
}

/// A regular file under the cache data root, as seen at scan time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheFile {
    /// Path relative to the cache root. Unique within a run.
    pub relative_path: PathBuf,
    pub size_bytes: u64,
    /// Seconds since the epoch.
    pub last_access: i64,
    pub fingerprint: Fingerprint,
}

impl CacheFile {
    pub fn from_metadata(relative_path: PathBuf, metadata: &Metadata) -> CacheFile {
        CacheFile {
            relative_path,
            size_bytes: metadata.len(),
            last_access: platform::last_access_secs(metadata),
            fingerprint: Fingerprint::from_metadata(metadata),
        }
    }
}
