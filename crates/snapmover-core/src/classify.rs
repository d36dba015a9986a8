use crate::scanner::CacheFile;
use crate::snapshot::{is_pinned, SnapshotMap};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Moving the file reclaims its blocks.
    Unpinned,
    /// A snapshot still holds the same content, so its blocks stay allocated.
    Pinned,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    pub unpinned: Vec<CacheFile>,
    pub pinned: Vec<CacheFile>,
}

impl Classified {
    pub fn len(&self) -> usize {
        self.unpinned.len() + self.pinned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unpinned.is_empty() && self.pinned.is_empty()
    }
}

pub fn classification_of(file: &CacheFile, map: &SnapshotMap) -> Classification {
    if !map.is_complete() || is_pinned(file, map) {
        Classification::Pinned
    } else {
        Classification::Unpinned
    }
}

/// Partition live files by whether a snapshot pins them. Enumeration order is
/// preserved inside each group.
///
/// When any snapshot could not be indexed completely nothing can be proven
/// free, and every file is reported as pinned.
pub fn classify(files: Vec<CacheFile>, map: &SnapshotMap) -> Classified {
    if !map.is_complete() {
        warn!(
            "Snapshot index incomplete for {:?}; classifying all {} files as pinned",
            map.incomplete(),
            files.len()
        );
    }

    let mut classified = Classified::default();
    for file in files {
        match classification_of(&file, map) {
            Classification::Unpinned => classified.unpinned.push(file),
            Classification::Pinned => classified.pinned.push(file),
        }
    }

    debug!(
        "Classified {} unpinned and {} pinned files",
        classified.unpinned.len(),
        classified.pinned.len()
    );
    classified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Fingerprint;
    use crate::snapshot::SnapshotRef;
    use std::path::PathBuf;

    fn file(path: &str, size: u64, secs: i64) -> CacheFile {
        CacheFile {
            relative_path: PathBuf::from(path),
            size_bytes: size,
            last_access: secs,
            fingerprint: Fingerprint {
                size,
                modified_secs: secs,
                modified_nanos: 0,
            },
        }
    }

    fn snapshot_of(snapshot: &str, file: &CacheFile) -> SnapshotRef {
        SnapshotRef {
            snapshot: snapshot.to_string(),
            fingerprint: file.fingerprint,
        }
    }

    #[test]
    fn test_file_without_entry_is_unpinned() {
        let classified = classify(vec![file("a", 1, 1)], &SnapshotMap::new());
        assert_eq!(classified.unpinned.len(), 1);
        assert!(classified.pinned.is_empty());
    }

    #[test]
    fn test_matching_fingerprint_is_pinned() {
        let a = file("a", 1, 1);
        let mut map = SnapshotMap::new();
        map.insert("a", snapshot_of("1", &a));

        let classified = classify(vec![a.clone(), file("b", 2, 2)], &map);
        assert_eq!(classified.pinned, vec![a]);
        assert_eq!(classified.unpinned.len(), 1);
    }

    #[test]
    fn test_diverged_fingerprint_is_unpinned() {
        let old = file("a", 1, 1);
        let mut map = SnapshotMap::new();
        map.insert("a", snapshot_of("1", &old));

        // Rewritten since the snapshot was taken.
        let live = file("a", 5, 9);
        let classified = classify(vec![live.clone()], &map);
        assert_eq!(classified.unpinned, vec![live]);
    }

    #[test]
    fn test_incomplete_index_pins_everything() {
        let mut map = SnapshotMap::new();
        map.mark_incomplete("4");

        let classified = classify(vec![file("a", 1, 1), file("b", 2, 2)], &map);
        assert!(classified.unpinned.is_empty());
        assert_eq!(classified.pinned.len(), 2);
    }

    #[test]
    fn test_enumeration_order_preserved() {
        let files = vec![file("z", 1, 3), file("a", 1, 1), file("m", 1, 2)];
        let classified = classify(files.clone(), &SnapshotMap::new());
        assert_eq!(classified.unpinned, files);
    }
}
