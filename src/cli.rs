use clap::Parser;
use snapmover_core::ProbeMode;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "snapmover")]
#[command(
    about = "Move cold files from a snapshotted cache pool to a backing pool",
    long_about = None
)]
pub struct Cli {
    /// Root of the cache pool
    pub cache: PathBuf,
    /// Root of the backing pool
    pub backing: PathBuf,
    /// Target usage of the cache pool as a fraction, e.g. 0.7
    #[arg(value_parser = parse_threshold)]
    pub threshold: f64,
    /// Snapshot index file (defaults to `metadata_path` from the config)
    #[arg(long, value_name = "PATH")]
    pub metadata: Option<PathBuf>,
    /// Report what would be moved without moving anything
    #[arg(long)]
    pub audit: bool,
    /// Log filter, e.g. info or snapmover_core=debug
    #[arg(long = "log_level", value_name = "LEVEL")]
    pub log_level: Option<String>,
    /// Also write logs to this file
    #[arg(long = "log_file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,
    /// Ignore the stored index and walk every snapshot
    #[arg(long)]
    pub rescan: bool,
    /// Configuration file (defaults to Config.toml if present)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Files per batch between usage checks
    #[arg(long, value_name = "N")]
    pub batch_size: Option<usize>,
    /// Concurrent transfers within a batch
    #[arg(long, value_name = "N")]
    pub jobs: Option<usize>,
    /// Usage tracking during moves: live or estimate
    #[arg(long, value_name = "MODE")]
    pub probe: Option<ProbeMode>,
}

fn parse_threshold(s: &str) -> Result<f64, String> {
    let value: f64 = s
        .parse()
        .map_err(|_| format!("'{}' is not a number", s))?;
    if value > 0.0 && value <= 1.0 {
        Ok(value)
    } else {
        Err(format!("threshold must be in (0.0, 1.0], got {}", value))
    }
}
