pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod mover;
pub mod planner;
pub mod platform;
pub mod probe;
pub mod progress;
pub mod scanner;
pub mod snapshot;

pub use classify::{classify, Classification, Classified};
pub use config::{MoverConfig, ProbeMode};
pub use engine::{MoveEngine, Phase, RunContext, RunOutcome, RunSummary, StopReason};
pub use error::{Error, MoveError, ProbeError};
pub use mover::{MoveOutcome, MoveRequest, MoveResult, Mover, RsyncTransfer, SkipReason, Transfer};
pub use planner::{MigrationCandidate, PlanResult};
pub use probe::{DiskUsage, StatvfsProbe, UsageProbe};
pub use progress::{ProgressReporter, SilentReporter};
pub use scanner::{CacheFile, Fingerprint};
pub use snapshot::{SnapshotIndex, SnapshotMap, SnapshotRef};
