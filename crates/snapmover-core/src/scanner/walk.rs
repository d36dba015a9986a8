use super::CacheFile;
use glob::Pattern;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, trace, warn};
use walkdir::WalkDir;

/// Traversal settings shared by the live cache walk and snapshot walks.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Directory names directly under the root that are never entered.
    pub skip_top_level: Vec<String>,
    pub ignore_patterns: Vec<Pattern>,
    /// Stay on the root's filesystem.
    pub same_file_system: bool,
}

impl WalkOptions {
    pub fn with_ignore_globs(mut self, ignore_globs: &[String]) -> Self {
        self.ignore_patterns = ignore_globs
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!("Invalid glob pattern '{}': {}", glob, e);
                    None
                }
            })
            .collect();
        self
    }

    /// Non-UTF-8 names are matched through their lossy form.
    fn is_ignored(&self, relative: &Path) -> bool {
        let relative = relative.to_string_lossy();
        self.ignore_patterns
            .iter()
            .any(|pattern| pattern.matches(&relative))
    }
}

/// Result of a bounded traversal: every regular file found, keyed by its path
/// relative to the walk root, plus the number of entries that could not be read.
#[derive(Debug, Default)]
pub struct WalkOutput {
    pub files: Vec<(PathBuf, Metadata)>,
    pub errors: usize,
}

/// Walk `root` to completion and return a materialized, sorted listing.
/// Symlinks are not followed. Paths are kept as raw OS strings, so names that
/// are not valid UTF-8 are listed like any other.
pub fn walk_tree(root: &Path, options: &WalkOptions) -> io::Result<WalkOutput> {
    // Fail up front if the root itself cannot be read.
    std::fs::read_dir(root)?;

    let mut output = WalkOutput::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .same_file_system(options.same_file_system)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let relative = match entry.path().strip_prefix(root) {
                Ok(relative) => relative,
                Err(_) => return false,
            };
            if entry.depth() == 1 && entry.file_type().is_dir() {
                let name = entry.file_name().to_string_lossy();
                if options.skip_top_level.iter().any(|skip| *skip == name) {
                    return false;
                }
            }
            !options.is_ignored(relative)
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Error walking {}: {}", root.display(), err);
                output.errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = match entry.path().strip_prefix(root) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => continue,
        };

        match entry.metadata() {
            Ok(metadata) => {
                trace!("Found {}", relative.display());
                output.files.push((relative, metadata));
            }
            Err(err) => {
                // Usually the file vanished between listing and stat.
                warn!("Error getting metadata for {}: {}", entry.path().display(), err);
                output.errors += 1;
            }
        }
    }

    Ok(output)
}

/// Enumerate the live files under the cache root. The snapshot directory is
/// never entered and the walk does not cross into other filesystems.
pub fn scan_cache(
    cache_root: &Path,
    snapshot_dir: &str,
    ignore_globs: &[String],
) -> io::Result<Vec<CacheFile>> {
    let options = WalkOptions {
        skip_top_level: vec![snapshot_dir.to_string()],
        same_file_system: true,
        ..WalkOptions::default()
    }
    .with_ignore_globs(ignore_globs);

    let output = walk_tree(cache_root, &options)?;
    if output.errors > 0 {
        warn!(
            "{} entries under {} could not be read and were skipped",
            output.errors,
            cache_root.display()
        );
    }

    Ok(output
        .files
        .into_iter()
        .map(|(relative, metadata)| CacheFile::from_metadata(relative, &metadata))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("media/tv")).unwrap();
        fs::create_dir_all(root.join(".snapshots/1/snapshot/media")).unwrap();
        fs::write(root.join("media/tv/ep1.mkv"), vec![1u8; 10]).unwrap();
        fs::write(root.join("media/tv/ep1.part"), vec![1u8; 3]).unwrap();
        fs::write(root.join("top.txt"), b"hello").unwrap();
        fs::write(root.join(".snapshots/1/snapshot/media/old.mkv"), b"old").unwrap();
    }

    #[test]
    fn test_scan_cache_skips_snapshot_dir() {
        let tmp = tempfile::tempdir().unwrap();
        build_tree(tmp.path());

        let files = scan_cache(tmp.path(), ".snapshots", &[]).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.relative_path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("media/tv/ep1.mkv"),
                PathBuf::from("media/tv/ep1.part"),
                PathBuf::from("top.txt"),
            ]
        );
        assert_eq!(files[0].size_bytes, 10);
        assert_eq!(files[0].fingerprint.size, 10);
    }

    #[test]
    fn test_scan_cache_applies_ignore_patterns() {
        let tmp = tempfile::tempdir().unwrap();
        build_tree(tmp.path());

        let files = scan_cache(tmp.path(), ".snapshots", &["**/*.part".to_string()]).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files
            .iter()
            .all(|f| f.relative_path.extension().unwrap() != "part"));
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_cache_keeps_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = tempfile::tempdir().unwrap();
        let latin1 = OsStr::from_bytes(b"caf\xe9.mkv");
        fs::write(tmp.path().join(latin1), vec![7u8; 4]).unwrap();
        fs::write(tmp.path().join("ok.mkv"), b"ok").unwrap();

        let files = scan_cache(tmp.path(), ".snapshots", &["*.part".to_string()]).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.relative_path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from(latin1), PathBuf::from("ok.mkv")]);
        assert_eq!(files[0].size_bytes, 4);
    }

    #[test]
    fn test_walk_tree_missing_root_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let result = walk_tree(&tmp.path().join("missing"), &WalkOptions::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_nested_snapshot_named_dir_is_walked() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("photos/.snapshots")).unwrap();
        fs::write(tmp.path().join("photos/.snapshots/keep.jpg"), b"x").unwrap();

        let files = scan_cache(tmp.path(), ".snapshots", &[]).unwrap();
        assert_eq!(files.len(), 1);
    }
}
