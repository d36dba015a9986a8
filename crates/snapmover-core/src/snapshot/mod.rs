//! Snapshot membership of cache files.
//!
//! The [`SnapshotIndex`] walks snapshot trees under the cache root and records,
//! for every relative path, which snapshots hold a copy and with what
//! [`Fingerprint`]. Results are persisted through [`SnapshotStore`] so runs
//! only walk snapshots that are new or changed.

mod index;
mod store;

pub use index::{IndexRefresh, IndexStats, SnapshotIndex};
pub use store::{SnapshotMarker, SnapshotStore, StoreData};

use crate::scanner::{CacheFile, Fingerprint};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// One snapshot's copy of a relative path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub snapshot: String,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotMap {
    entries: BTreeMap<PathBuf, BTreeSet<SnapshotRef>>,
    /// Snapshots that exist but could not be walked completely.
    incomplete: BTreeSet<String>,
}

impl SnapshotMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<PathBuf, BTreeSet<SnapshotRef>>) -> Self {
        Self {
            entries,
            incomplete: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, relative_path: impl Into<PathBuf>, reference: SnapshotRef) {
        self.entries
            .entry(relative_path.into())
            .or_default()
            .insert(reference);
    }

    pub fn mark_incomplete(&mut self, snapshot: impl Into<String>) {
        self.incomplete.insert(snapshot.into());
    }

    pub fn references(&self, relative_path: &Path) -> Option<&BTreeSet<SnapshotRef>> {
        self.entries.get(relative_path)
    }

    pub fn incomplete(&self) -> &BTreeSet<String> {
        &self.incomplete
    }

    pub fn is_complete(&self) -> bool {
        self.incomplete.is_empty()
    }

    /// Number of distinct relative paths held by at least one snapshot.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<PathBuf, BTreeSet<SnapshotRef>> {
        &self.entries
    }
}

/// True iff some snapshot still holds `file` with identical content.
pub fn is_pinned(file: &CacheFile, map: &SnapshotMap) -> bool {
    map.references(&file.relative_path)
        .map(|refs| refs.iter().any(|r| r.fingerprint == file.fingerprint))
        .unwrap_or(false)
}
