use super::SnapshotRef;
use crate::error::Error;
use crate::hasher;
use crate::platform;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

const MAGIC: &[u8; 8] = b"SNAPMVR\0";
const FORMAT_VERSION: u32 = 1;
const HEADER_LENGTH: usize = MAGIC.len() + 4 + 8;

/// Modification time of a snapshot's data root, used to decide whether the
/// persisted references for that snapshot can be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMarker {
    pub modified_secs: i64,
    pub modified_nanos: u32,
}

impl SnapshotMarker {
    pub fn from_time(time: SystemTime) -> Self {
        let (modified_secs, modified_nanos) = platform::split_timestamp(time);
        Self {
            modified_secs,
            modified_nanos,
        }
    }
}

/// Persisted form of the snapshot index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreData {
    pub tool_version: String,
    #[serde(with = "raw_path")]
    pub cache_root: PathBuf,
    /// Snapshots whose references are complete, with the marker seen at walk time.
    pub snapshots: BTreeMap<String, SnapshotMarker>,
    #[serde(with = "raw_path_entries")]
    pub entries: BTreeMap<PathBuf, BTreeSet<SnapshotRef>>,
}

/// Paths are stored as raw OS bytes so names that are not UTF-8 survive.
mod raw_path {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::path::{Path, PathBuf};

    #[cfg(unix)]
    pub fn to_bytes(path: &Path) -> Vec<u8> {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    }

    #[cfg(not(unix))]
    pub fn to_bytes(path: &Path) -> Vec<u8> {
        path.to_string_lossy().into_owned().into_bytes()
    }

    #[cfg(unix)]
    pub fn from_bytes(bytes: Vec<u8>) -> PathBuf {
        use std::os::unix::ffi::OsStringExt;
        PathBuf::from(std::ffi::OsString::from_vec(bytes))
    }

    #[cfg(not(unix))]
    pub fn from_bytes(bytes: Vec<u8>) -> PathBuf {
        PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn serialize<S: Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
        to_bytes(path).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        Vec::<u8>::deserialize(deserializer).map(from_bytes)
    }
}

mod raw_path_entries {
    use super::raw_path;
    use crate::snapshot::SnapshotRef;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;

    type Entries = BTreeMap<PathBuf, BTreeSet<SnapshotRef>>;

    pub fn serialize<S: Serializer>(entries: &Entries, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(
            entries
                .iter()
                .map(|(path, refs)| (raw_path::to_bytes(path), refs)),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Entries, D::Error> {
        let raw = BTreeMap::<Vec<u8>, BTreeSet<SnapshotRef>>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(path, refs)| (raw_path::from_bytes(path), refs))
            .collect())
    }
}

impl StoreData {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            cache_root: cache_root.to_path_buf(),
            snapshots: BTreeMap::new(),
            entries: BTreeMap::new(),
        }
    }

    /// Drop every reference that does not belong to one of `keep`.
    pub fn retain_snapshots(&mut self, keep: &BTreeSet<String>) {
        self.snapshots.retain(|name, _| keep.contains(name));
        self.entries.retain(|_, refs| {
            refs.retain(|r| keep.contains(&r.snapshot));
            !refs.is_empty()
        });
    }
}

/// On-disk home of [`StoreData`].
///
/// Layout: magic, little-endian format version, little-endian XxHash64 of the
/// payload, then the bincode payload. Anything that does not check out is
/// reported as [`Error::MetadataCorrupt`].
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no store exists yet.
    pub fn load(&self, cache_root: &Path) -> Result<Option<StoreData>, Error> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No metadata store at {}", self.path.display());
                return Ok(None);
            }
            Err(err) => {
                return Err(Error::MetadataCorrupt(format!(
                    "cannot read {}: {}",
                    self.path.display(),
                    err
                )))
            }
        };

        let data = decode(&bytes)?;
        if data.cache_root != cache_root {
            return Err(Error::MetadataCorrupt(format!(
                "store was built for {}, not {}",
                data.cache_root.display(),
                cache_root.display()
            )));
        }
        if data.tool_version != env!("CARGO_PKG_VERSION") {
            return Err(Error::MetadataCorrupt(format!(
                "store was written by version {}",
                data.tool_version
            )));
        }

        debug!(
            "Loaded metadata store {} ({} snapshots, {} paths)",
            self.path.display(),
            data.snapshots.len(),
            data.entries.len()
        );
        Ok(Some(data))
    }

    /// Write atomically: a sibling temp file is synced, then renamed over the store.
    pub fn save(&self, data: &StoreData) -> Result<(), Error> {
        let bytes = encode(data)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!(
            "Saved metadata store {} ({} bytes)",
            self.path.display(),
            bytes.len()
        );
        Ok(())
    }
}

fn encode(data: &StoreData) -> Result<Vec<u8>, Error> {
    let payload = bincode::serialize(data)
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, format!("Serialize error: {}", e))))?;

    let mut bytes = Vec::with_capacity(HEADER_LENGTH + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&hasher::hash_data(&payload).to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> Result<StoreData, Error> {
    if bytes.len() < HEADER_LENGTH {
        return Err(Error::MetadataCorrupt("truncated header".to_string()));
    }
    let (magic, rest) = bytes.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err(Error::MetadataCorrupt("bad magic".to_string()));
    }

    let (version, rest) = rest.split_at(4);
    let version = u32::from_le_bytes([version[0], version[1], version[2], version[3]]);
    if version != FORMAT_VERSION {
        return Err(Error::MetadataCorrupt(format!(
            "unsupported format version {}",
            version
        )));
    }

    let (checksum, payload) = rest.split_at(8);
    let mut checksum_bytes = [0u8; 8];
    checksum_bytes.copy_from_slice(checksum);
    if u64::from_le_bytes(checksum_bytes) != hasher::hash_data(payload) {
        return Err(Error::MetadataCorrupt("checksum mismatch".to_string()));
    }

    bincode::deserialize(payload)
        .map_err(|e| Error::MetadataCorrupt(format!("Deserialize error: {}", e)))
}
