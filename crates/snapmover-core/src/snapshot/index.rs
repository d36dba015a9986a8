use super::store::{SnapshotMarker, SnapshotStore, StoreData};
use super::{SnapshotMap, SnapshotRef};
use crate::config::MoverConfig;
use crate::error::Error;
use crate::scanner::{walk_tree, Fingerprint, WalkOptions};
use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A snapshot directory found under the snapshot root.
#[derive(Debug, Clone)]
struct ObservedSnapshot {
    data_root: PathBuf,
    marker: SnapshotMarker,
}

/// Counters describing how a refresh was satisfied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub observed: usize,
    pub reused: usize,
    pub walked: usize,
    pub dropped: usize,
    pub incomplete: usize,
    pub loaded_from_store: bool,
    pub saved: bool,
}

#[derive(Debug)]
pub struct IndexRefresh {
    pub map: SnapshotMap,
    pub stats: IndexStats,
}

struct SnapshotWalk {
    refs: Vec<(PathBuf, Fingerprint)>,
    errors: usize,
}

pub struct SnapshotIndex {
    cache_root: PathBuf,
    snapshot_dir: String,
    snapshot_subdir: Option<String>,
    store: Option<SnapshotStore>,
    force_rescan: bool,
}

impl SnapshotIndex {
    pub fn new(cache_root: impl Into<PathBuf>, snapshot_dir: &str) -> Self {
        Self {
            cache_root: cache_root.into(),
            snapshot_dir: snapshot_dir.to_string(),
            snapshot_subdir: None,
            store: None,
            force_rescan: false,
        }
    }

    pub fn from_config(config: &MoverConfig) -> Self {
        Self::new(&config.cache_root, &config.snapshot_dir)
            .with_subdir(config.snapshot_subdir.as_deref())
            .with_store(config.metadata_path.as_deref())
            .with_force_rescan(config.force_rescan)
    }

    pub fn with_subdir(mut self, subdir: Option<&str>) -> Self {
        self.snapshot_subdir = subdir.map(str::to_string);
        self
    }

    pub fn with_store(mut self, path: Option<&Path>) -> Self {
        self.store = path.map(SnapshotStore::new);
        self
    }

    pub fn with_force_rescan(mut self, force: bool) -> Self {
        self.force_rescan = force;
        self
    }

    /// Bring the index up to date with the snapshots currently on disk.
    ///
    /// Persisted references are reused for snapshots whose marker is unchanged;
    /// new or changed snapshots are walked in parallel and snapshots that no
    /// longer exist are dropped. A store that cannot be read is logged and
    /// ignored, which turns this into a full rescan.
    pub fn refresh(&self) -> Result<IndexRefresh, Error> {
        let observed = self.observe().map_err(|e| {
            Error::Classification(format!(
                "cannot list snapshots under {}: {}",
                self.snapshot_root().display(),
                e
            ))
        })?;

        let previous = self.load_store();
        let mut stats = IndexStats {
            observed: observed.len(),
            loaded_from_store: previous.is_some(),
            ..IndexStats::default()
        };
        let mut data = previous.unwrap_or_else(|| StoreData::new(&self.cache_root));

        let reusable: BTreeSet<String> = observed
            .iter()
            .filter(|(name, snap)| data.snapshots.get(*name) == Some(&snap.marker))
            .map(|(name, _)| name.clone())
            .collect();
        stats.reused = reusable.len();
        stats.dropped = data
            .snapshots
            .keys()
            .filter(|name| !observed.contains_key(*name))
            .count();
        data.retain_snapshots(&reusable);

        let to_walk: Vec<(&String, &ObservedSnapshot)> = observed
            .iter()
            .filter(|(name, _)| !reusable.contains(*name))
            .collect();
        stats.walked = to_walk.len();
        if !to_walk.is_empty() {
            info!("Walking {} new or changed snapshot(s)...", to_walk.len());
        }

        let walks: DashMap<String, io::Result<SnapshotWalk>> = DashMap::new();
        to_walk.par_iter().for_each(|(name, snap)| {
            debug!("Walking snapshot {} at {}", name, snap.data_root.display());
            walks.insert((*name).clone(), walk_snapshot(&snap.data_root));
        });

        let mut incomplete = BTreeSet::new();
        for (name, walk) in walks {
            let walk = walk.map_err(|e| {
                Error::Classification(format!("cannot walk snapshot {}: {}", name, e))
            })?;
            let errors = walk.errors;
            let marker = observed.get(&name).map(|snap| snap.marker);
            if !merge_walk(&mut data, &name, walk, marker) {
                warn!(
                    "Snapshot {} had {} unreadable entries; its files will be treated as pinned",
                    name, errors
                );
                incomplete.insert(name);
            }
        }
        stats.incomplete = incomplete.len();

        let changed = stats.walked > 0 || stats.dropped > 0 || !stats.loaded_from_store;
        if changed {
            stats.saved = self.save_store(&data);
        }

        let mut map = SnapshotMap::from_entries(data.entries);
        for name in incomplete {
            map.mark_incomplete(name);
        }

        debug!("Snapshot index refreshed: {:?}", stats);
        Ok(IndexRefresh { map, stats })
    }

    fn snapshot_root(&self) -> PathBuf {
        self.cache_root.join(&self.snapshot_dir)
    }

    /// List snapshot directories and read their markers. A missing snapshot
    /// root means there are no snapshots.
    fn observe(&self) -> io::Result<BTreeMap<String, ObservedSnapshot>> {
        let root = self.snapshot_root();
        let mut observed = BTreeMap::new();

        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No snapshot directory at {}", root.display());
                return Ok(observed);
            }
            Err(err) => return Err(err),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!("Skipping snapshot with non UTF-8 name {:?}", raw);
                    continue;
                }
            };

            let mut data_root = entry.path();
            if let Some(subdir) = &self.snapshot_subdir {
                let nested = data_root.join(subdir);
                if nested.is_dir() {
                    data_root = nested;
                }
            }
            let marker = SnapshotMarker::from_time(fs::metadata(&data_root)?.modified()?);
            observed.insert(name, ObservedSnapshot { data_root, marker });
        }

        debug!(
            "Found {} snapshot(s) under {}: {:?}",
            observed.len(),
            root.display(),
            observed.keys().collect::<Vec<_>>()
        );
        Ok(observed)
    }

    fn load_store(&self) -> Option<StoreData> {
        let store = self.store.as_ref()?;
        if self.force_rescan {
            info!("Rescan forced; ignoring metadata store {}", store.path().display());
            return None;
        }
        match store.load(&self.cache_root) {
            Ok(data) => data,
            Err(err) => {
                warn!("{}; falling back to a full snapshot rescan", err);
                None
            }
        }
    }

    fn save_store(&self, data: &StoreData) -> bool {
        let store = match &self.store {
            Some(store) => store,
            None => return false,
        };
        match store.save(data) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    "Failed to save metadata store {}: {}",
                    store.path().display(),
                    err
                );
                false
            }
        }
    }
}

/// Fold one snapshot walk into `data`. The marker is recorded only for a
/// complete walk, so an incomplete snapshot is walked again by the next refresh.
/// Returns whether the walk was complete.
fn merge_walk(
    data: &mut StoreData,
    name: &str,
    walk: SnapshotWalk,
    marker: Option<SnapshotMarker>,
) -> bool {
    for (relative, fingerprint) in walk.refs {
        data.entries.entry(relative).or_default().insert(SnapshotRef {
            snapshot: name.to_string(),
            fingerprint,
        });
    }
    if walk.errors > 0 {
        return false;
    }
    if let Some(marker) = marker {
        data.snapshots.insert(name.to_string(), marker);
    }
    true
}

fn walk_snapshot(data_root: &Path) -> io::Result<SnapshotWalk> {
    let output = walk_tree(data_root, &WalkOptions::default())?;
    Ok(SnapshotWalk {
        refs: output
            .files
            .into_iter()
            .map(|(relative, metadata)| (relative, Fingerprint::from_metadata(&metadata)))
            .collect(),
        errors: output.errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(size: u64) -> Fingerprint {
        Fingerprint {
            size,
            modified_secs: 1_600_000_000,
            modified_nanos: 0,
        }
    }

    fn walk(errors: usize) -> SnapshotWalk {
        SnapshotWalk {
            refs: vec![(PathBuf::from("a.txt"), fingerprint(5))],
            errors,
        }
    }

    #[test]
    fn test_merge_complete_walk_records_marker() {
        let mut data = StoreData::new(Path::new("/mnt/cache"));
        let marker = SnapshotMarker {
            modified_secs: 1_700_000_000,
            modified_nanos: 0,
        };

        assert!(merge_walk(&mut data, "4", walk(0), Some(marker)));
        assert_eq!(data.snapshots.get("4"), Some(&marker));
        assert_eq!(data.entries[Path::new("a.txt")].len(), 1);
    }

    #[test]
    fn test_incomplete_snapshot_is_walked_again() {
        let cache = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let store_path = state.path().join("index.bin");
        let data_root = cache.path().join(".snapshots/1/snapshot");
        fs::create_dir_all(&data_root).unwrap();
        fs::write(data_root.join("a.txt"), b"hello").unwrap();

        let index = SnapshotIndex::new(cache.path(), ".snapshots")
            .with_subdir(Some("snapshot"))
            .with_store(Some(store_path.as_path()));
        let observed = index.observe().unwrap();
        let marker = observed["1"].marker;

        // A walk that hit an unreadable entry keeps its references but not its marker.
        let mut data = StoreData::new(cache.path());
        assert!(!merge_walk(&mut data, "1", walk(1), Some(marker)));
        assert!(!data.snapshots.contains_key("1"));
        assert!(data.entries.contains_key(Path::new("a.txt")));
        SnapshotStore::new(&store_path).save(&data).unwrap();

        let next = index.refresh().unwrap();
        assert!(next.stats.loaded_from_store);
        assert_eq!(next.stats.reused, 0);
        assert_eq!(next.stats.walked, 1);
        assert_eq!(next.stats.incomplete, 0);
        assert!(next.stats.saved);
        assert!(next.map.is_complete());

        let after = index.refresh().unwrap();
        assert_eq!(after.stats.reused, 1);
        assert_eq!(after.stats.walked, 0);
    }
}
