/// Trait for reporting run progress.
///
/// The CLI implements this with indicatif. All methods have default no-op
/// implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_scan_start(&self) {}
    fn on_scan_complete(&self, _total_files: usize, _duration_secs: f64) {}
    fn on_index_start(&self) {}
    fn on_index_complete(&self, _snapshots: usize, _walked: usize, _duration_secs: f64) {}
    fn on_move_start(&self, _planned_files: usize, _planned_bytes: u64) {}
    fn on_move_progress(&self, _files_done: usize, _bytes_reclaimed: u64) {}
    fn on_move_complete(&self, _moved: usize, _bytes_moved: u64, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
