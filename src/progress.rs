use indicatif::{ProgressBar, ProgressStyle};
use snapmover_core::ProgressReporter;
use std::sync::Mutex;
use std::time::Duration;

/// CLI progress reporter using indicatif.
///
/// - Scan and index phases: spinner
/// - Move phase: bar over the planned file count, which may be exceeded when
///   failures pull in reserve candidates
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn spinner(&self, message: &'static str) {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            pb.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn set_bar(&self, pb: ProgressBar) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.take() {
                old.finish_and_clear();
            }
            *guard = Some(pb);
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }
}

impl ProgressReporter for CliReporter {
    fn on_scan_start(&self) {
        self.spinner("Scanning cache files...");
    }

    fn on_scan_complete(&self, total_files: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Scan complete: {} files in {:.2}s",
            total_files, duration_secs
        );
    }

    fn on_index_start(&self) {
        self.spinner("Indexing snapshots...");
    }

    fn on_index_complete(&self, snapshots: usize, walked: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Snapshot index ready: {} snapshots ({} walked) in {:.2}s",
            snapshots, walked, duration_secs
        );
    }

    fn on_move_start(&self, planned_files: usize, _planned_bytes: u64) {
        let pb = ProgressBar::new(planned_files as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "  {spinner:.cyan} Moving [{bar:30.cyan/dim}] {pos}/{len} files, {msg}",
        ) {
            pb.set_style(style.progress_chars("━╸─").tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }
        pb.set_message("0 B reclaimed");
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_move_progress(&self, files_done: usize, bytes_reclaimed: u64) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                if files_done as u64 > pb.length().unwrap_or(0) {
                    pb.set_length(files_done as u64);
                }
                pb.set_position(files_done as u64);
                pb.set_message(format!(
                    "{} reclaimed",
                    indicatif::HumanBytes(bytes_reclaimed)
                ));
            }
        }
    }

    fn on_move_complete(&self, moved: usize, bytes_moved: u64, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Move complete: {} files ({}) in {:.2}s",
            moved,
            indicatif::HumanBytes(bytes_moved),
            duration_secs
        );
    }
}
