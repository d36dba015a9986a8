use crate::error::Error;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_METADATA_PATH: &str = "snapmover_index.bin";

/// How often the engine asks the filesystem for fresh usage numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Re-probe after every batch of moves.
    Live,
    /// Probe once, then project usage from the bytes moved.
    Estimate,
}

impl std::str::FromStr for ProbeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "live" => Ok(ProbeMode::Live),
            "estimate" => Ok(ProbeMode::Estimate),
            other => Err(format!("unknown probe mode '{}'", other)),
        }
    }
}

/// Settings read from `Config.toml` and `SNAPMOVER_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub metadata_path: String,
    pub snapshot_dir: String,
    pub snapshot_subdir: Option<String>,
    pub ignore_patterns: Vec<String>,
    pub rsync_path: String,
    pub rsync_args: Vec<String>,
    pub verify_checksum: bool,
    pub batch_size: usize,
    pub max_transfers: usize,
    pub probe_mode: ProbeMode,
    pub require_mount_point: bool,
    pub require_distinct_devices: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            metadata_path: DEFAULT_METADATA_PATH.to_string(),
            snapshot_dir: ".snapshots".to_string(),
            snapshot_subdir: Some("snapshot".to_string()),
            ignore_patterns: Vec::new(),
            rsync_path: "rsync".to_string(),
            rsync_args: vec!["-axqHAXWES".to_string(), "--preallocate".to_string()],
            verify_checksum: false,
            batch_size: 1,
            max_transfers: 1,
            probe_mode: ProbeMode::Live,
            require_mount_point: true,
            require_distinct_devices: true,
        }
    }
}

/// Load configuration from `path` (or an optional `Config.toml` in the working
/// directory) layered under `SNAPMOVER_*` environment variables.
pub fn load_configuration(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let file_source = match path {
        Some(path) => ConfigFile::from(path.to_path_buf()).required(true),
        None => ConfigFile::with_name("Config").required(false),
    };

    let builder = Config::builder()
        .add_source(file_source)
        .add_source(
            Environment::with_prefix("SNAPMOVER")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ignore_patterns")
                .with_list_parse_key("rsync_args"),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct MoverConfig {
    pub cache_root: PathBuf,
    pub backing_root: PathBuf,
    pub threshold: f64,
    pub metadata_path: Option<PathBuf>,
    pub audit: bool,
    pub force_rescan: bool,
    pub snapshot_dir: String,
    pub snapshot_subdir: Option<String>,
    pub ignore_patterns: Vec<String>,
    pub batch_size: usize,
    pub max_transfers: usize,
    pub probe_mode: ProbeMode,
    /// Refuse to run when cache and backing live on the same device.
    pub require_distinct_devices: bool,
}

impl MoverConfig {
    pub fn new(cache_root: impl Into<PathBuf>, backing_root: impl Into<PathBuf>, threshold: f64) -> Self {
        let defaults = AppConfig::default();
        Self {
            cache_root: cache_root.into(),
            backing_root: backing_root.into(),
            threshold,
            metadata_path: None,
            audit: false,
            force_rescan: false,
            snapshot_dir: defaults.snapshot_dir,
            snapshot_subdir: defaults.snapshot_subdir,
            ignore_patterns: defaults.ignore_patterns,
            batch_size: defaults.batch_size,
            max_transfers: defaults.max_transfers,
            probe_mode: defaults.probe_mode,
            require_distinct_devices: defaults.require_distinct_devices,
        }
    }

    /// Apply the file/environment settings that are not given on the command line.
    pub fn with_app_config(mut self, app: &AppConfig) -> Self {
        self.metadata_path = Some(PathBuf::from(&app.metadata_path));
        self.snapshot_dir = app.snapshot_dir.clone();
        self.snapshot_subdir = app.snapshot_subdir.clone().filter(|s| !s.is_empty());
        self.ignore_patterns = app.ignore_patterns.clone();
        self.batch_size = app.batch_size;
        self.max_transfers = app.max_transfers;
        self.probe_mode = app.probe_mode;
        self.require_distinct_devices = app.require_distinct_devices;
        self
    }

    pub fn with_metadata_path(mut self, path: Option<PathBuf>) -> Self {
        self.metadata_path = path;
        self
    }

    pub fn with_audit(mut self, audit: bool) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_force_rescan(mut self, force: bool) -> Self {
        self.force_rescan = force;
        self
    }

    pub fn with_batching(mut self, batch_size: usize, max_transfers: usize) -> Self {
        self.batch_size = batch_size;
        self.max_transfers = max_transfers;
        self
    }

    pub fn with_probe_mode(mut self, mode: ProbeMode) -> Self {
        self.probe_mode = mode;
        self
    }

    pub fn with_device_check(mut self, required: bool) -> Self {
        self.require_distinct_devices = required;
        self
    }

    pub fn snapshot_root(&self) -> PathBuf {
        self.cache_root.join(&self.snapshot_dir)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(Error::Config(format!(
                "threshold must be in (0.0, 1.0], got {}",
                self.threshold
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_transfers == 0 {
            return Err(Error::Config("max_transfers must be at least 1".to_string()));
        }
        if self.snapshot_dir.is_empty() || Path::new(&self.snapshot_dir).is_absolute() {
            return Err(Error::Config(format!(
                "snapshot_dir must be a relative directory name, got '{}'",
                self.snapshot_dir
            )));
        }
        Ok(())
    }
}
