use crate::classify::{classify, Classified};
use crate::config::{AppConfig, MoverConfig, ProbeMode};
use crate::error::{Error, MoveError};
use crate::mover::{MoveOutcome, MoveResult, Mover, RsyncTransfer, SkipReason, Transfer};
use crate::planner::{self, MigrationCandidate, PlanResult};
use crate::platform;
use crate::probe::{DiskUsage, StatvfsProbe, UsageProbe};
use crate::progress::ProgressReporter;
use crate::scanner;
use crate::snapshot::{IndexStats, SnapshotIndex};
use rayon::prelude::*;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Where a run currently is. Audit runs go from `Selecting` straight to `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Measuring,
    Classifying,
    Ordering,
    Selecting,
    Executing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Usage was already at or below the threshold.
    NothingToDo,
    /// Audit mode: the plan was reported and nothing was moved.
    Audit,
    /// Usage is at or below the threshold, by probe in live mode and by
    /// projection in estimate mode.
    ThresholdReached,
    /// Live mode only: moved bytes cover the need but the last re-probe
    /// failed, so the threshold is not confirmed.
    EstimateReached,
    /// Every candidate was tried and the threshold is still not met.
    CandidatesExhausted,
    Cancelled,
}

#[derive(Debug)]
pub struct RunSummary {
    pub moved: usize,
    pub bytes_moved: u64,
    pub skipped: usize,
    pub failed: usize,
    /// Copied and verified, but the source could not be removed.
    pub partial: usize,
    pub failures: Vec<MoveError>,
    pub final_usage: DiskUsage,
    pub stop_reason: StopReason,
    pub duration: Duration,
}

impl RunSummary {
    fn new(usage: DiskUsage, stop_reason: StopReason) -> Self {
        Self {
            moved: 0,
            bytes_moved: 0,
            skipped: 0,
            failed: 0,
            partial: 0,
            failures: Vec::new(),
            final_usage: usage,
            stop_reason,
            duration: Duration::ZERO,
        }
    }

    fn record(&mut self, candidate: &MigrationCandidate, result: MoveResult) {
        let path = candidate.file.relative_path.display();
        match result {
            Ok(MoveOutcome::Moved { bytes }) => {
                debug!("Moved {} ({} bytes)", path, bytes);
                self.moved += 1;
                self.bytes_moved += bytes;
            }
            Ok(MoveOutcome::Skipped(SkipReason::Vanished)) => {
                info!("Skipped {}: no longer in the cache", path);
                self.skipped += 1;
            }
            Ok(MoveOutcome::Skipped(SkipReason::Changed)) => {
                info!("Skipped {}: modified since it was classified", path);
                self.skipped += 1;
            }
            Err(err) if err.is_partial() => {
                error!("{} (data exists in both pools, manual cleanup needed)", err);
                self.partial += 1;
                self.failures.push(err);
            }
            Err(err) => {
                warn!("{}", err);
                self.failed += 1;
                self.failures.push(err);
            }
        }
    }
}

/// Explicit state threaded through the stages of one run.
pub struct RunContext {
    phase: Phase,
    cancel_token: Arc<AtomicBool>,
    reclaimed: AtomicU64,
    initial_usage: Option<DiskUsage>,
    latest_usage: Option<DiskUsage>,
    started_at: Instant,
}

impl RunContext {
    pub fn new(cancel_token: Arc<AtomicBool>) -> Self {
        Self {
            phase: Phase::Idle,
            cancel_token,
            reclaimed: AtomicU64::new(0),
            initial_usage: None,
            latest_usage: None,
            started_at: Instant::now(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.load(Ordering::Relaxed)
    }

    /// Bytes reclaimed by verified moves so far.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::SeqCst)
    }

    fn add_reclaimed(&self, bytes: u64) -> u64 {
        self.reclaimed.fetch_add(bytes, Ordering::SeqCst) + bytes
    }

    fn record_usage(&mut self, usage: DiskUsage) {
        if self.initial_usage.is_none() {
            self.initial_usage = Some(usage);
        }
        self.latest_usage = Some(usage);
    }

    /// Latest probed usage, or the initial probe minus what has been moved.
    fn estimated_usage(&self, mode: ProbeMode) -> Option<DiskUsage> {
        match mode {
            ProbeMode::Live => self.latest_usage,
            ProbeMode::Estimate => self
                .initial_usage
                .map(|usage| usage.after_reclaim(self.reclaimed())),
        }
    }
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub plan: PlanResult,
    pub summary: RunSummary,
    pub index_stats: Option<IndexStats>,
    /// Sum of live file sizes under the cache root.
    pub live_bytes: u64,
}

impl RunOutcome {
    /// Used space not accounted for by live files, i.e. held by snapshots or
    /// other filesystem overhead.
    pub fn snapshot_held_bytes(&self) -> u64 {
        self.plan.usage.used_bytes.saturating_sub(self.live_bytes)
    }
}

pub struct MoveEngine {
    config: MoverConfig,
    probe: Arc<dyn UsageProbe>,
    transfer: Arc<dyn Transfer>,
    cancel_token: Arc<AtomicBool>,
}

impl MoveEngine {
    /// Probe and transfer come from the built-in [`AppConfig`] defaults.
    pub fn new(config: MoverConfig) -> Self {
        let defaults = AppConfig::default();
        Self {
            config,
            probe: Arc::new(StatvfsProbe::new(defaults.require_mount_point)),
            transfer: Arc::new(RsyncTransfer::from_config(&defaults)),
            cancel_token: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn UsageProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_transfer(mut self, transfer: Arc<dyn Transfer>) -> Self {
        self.transfer = transfer;
        self
    }

    /// Setting the token stops the run once in-flight transfers finish.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel_token.clone()
    }

    pub fn config(&self) -> &MoverConfig {
        &self.config
    }

    /// Run the whole pipeline:
    /// 1. Probe usage, stopping if already within the threshold
    /// 2. Scan the cache and refresh the snapshot index
    /// 3. Classify, order and select candidates
    /// 4. Move selected files in batches (skipped in audit mode)
    pub fn run(&self, reporter: &dyn ProgressReporter) -> Result<RunOutcome, Error> {
        self.config.validate()?;
        self.preflight()?;

        let mut ctx = RunContext::new(self.cancel_token.clone());
        let threshold = self.config.threshold;

        ctx.enter(Phase::Measuring);
        let usage = self.probe.measure(&self.config.cache_root)?;
        ctx.record_usage(usage);
        if usage.is_within(threshold) {
            info!(
                "Not continuing... disk usage ({:.3}) <= threshold ({:.3})",
                usage.used_fraction(),
                threshold
            );
            ctx.enter(Phase::Done);
            let mut summary = RunSummary::new(usage, StopReason::NothingToDo);
            summary.duration = ctx.started_at.elapsed();
            return Ok(RunOutcome {
                plan: PlanResult::empty(usage, threshold),
                summary,
                index_stats: None,
                live_bytes: 0,
            });
        }
        info!(
            "Disk usage ({:.3}) above threshold ({:.3}), {} bytes to reclaim",
            usage.used_fraction(),
            threshold,
            usage.needed_reclaim_bytes(threshold)
        );

        ctx.enter(Phase::Classifying);
        let (classified, index_stats) = self.classify_stage(reporter)?;
        let live_bytes: u64 = classified
            .unpinned
            .iter()
            .chain(classified.pinned.iter())
            .map(|f| f.size_bytes)
            .sum();
        info!(
            "{} live bytes in {} files; {} used bytes held outside live files",
            live_bytes,
            classified.len(),
            usage.used_bytes.saturating_sub(live_bytes)
        );

        ctx.enter(Phase::Ordering);
        let candidates = planner::order_candidates(classified);

        ctx.enter(Phase::Selecting);
        let plan = planner::select(usage, threshold, candidates);
        if !plan.satisfiable() {
            warn!(
                "All {} candidates together cover only {} of {} needed bytes; cache capacity may be insufficient",
                plan.candidates.len(),
                plan.projected_reclaim_bytes(),
                plan.needed_bytes
            );
        }

        if self.config.audit {
            info!(
                "AUDIT: {} file(s) would be moved, projected usage {:.3}",
                plan.selected_len,
                plan.projected_usage()
            );
            ctx.enter(Phase::Done);
            let mut summary = RunSummary::new(
                usage.after_reclaim(plan.projected_reclaim_bytes()),
                StopReason::Audit,
            );
            summary.duration = ctx.started_at.elapsed();
            return Ok(RunOutcome {
                plan,
                summary,
                index_stats: Some(index_stats),
                live_bytes,
            });
        }

        ctx.enter(Phase::Executing);
        let mut summary = self.execute(&mut ctx, &plan, reporter)?;
        ctx.enter(Phase::Done);
        summary.duration = ctx.started_at.elapsed();

        info!(
            "Moved {} file(s) with total size of {:.3} GiB ({:?})",
            summary.moved,
            summary.bytes_moved as f64 / 1_073_741_824.0,
            summary.stop_reason
        );
        Ok(RunOutcome {
            plan,
            summary,
            index_stats: Some(index_stats),
            live_bytes,
        })
    }

    /// Cache and backing must both be directories on different devices.
    fn preflight(&self) -> Result<(), Error> {
        for (label, path) in [
            ("cache", &self.config.cache_root),
            ("backing", &self.config.backing_root),
        ] {
            if !path.is_dir() {
                return Err(Error::Preflight(format!(
                    "{} pool {} is not a directory",
                    label,
                    path.display()
                )));
            }
        }

        if self.config.require_distinct_devices {
            let cache_dev = platform::device_id(&self.config.cache_root)?;
            let backing_dev = platform::device_id(&self.config.backing_root)?;
            if cache_dev.is_some() && cache_dev == backing_dev {
                return Err(Error::Preflight(
                    "cache pool must not be on the same device as the backing pool".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn classify_stage(
        &self,
        reporter: &dyn ProgressReporter,
    ) -> Result<(Classified, IndexStats), Error> {
        info!("Scanning cache files...");
        reporter.on_scan_start();
        let scan_start = Instant::now();
        let files = scanner::scan_cache(
            &self.config.cache_root,
            &self.config.snapshot_dir,
            &self.config.ignore_patterns,
        )
        .map_err(|e| {
            Error::Classification(format!(
                "cannot scan {}: {}",
                self.config.cache_root.display(),
                e
            ))
        })?;
        reporter.on_scan_complete(files.len(), scan_start.elapsed().as_secs_f64());

        info!("Refreshing snapshot index...");
        reporter.on_index_start();
        let index_start = Instant::now();
        let refresh = SnapshotIndex::from_config(&self.config).refresh()?;
        reporter.on_index_complete(
            refresh.stats.observed,
            refresh.stats.walked,
            index_start.elapsed().as_secs_f64(),
        );

        Ok((classify(files, &refresh.map), refresh.stats))
    }

    fn execute(
        &self,
        ctx: &mut RunContext,
        plan: &PlanResult,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunSummary, Error> {
        let mover = Mover::new(
            &self.config.cache_root,
            &self.config.backing_root,
            self.transfer.clone(),
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_transfers)
            .build()
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;

        let needed = plan.needed_bytes;
        let threshold = self.config.threshold;
        let mode = self.config.probe_mode;
        let candidates = &plan.candidates;
        let mut summary = RunSummary::new(plan.usage, StopReason::CandidatesExhausted);
        let move_start = Instant::now();
        let mut next = 0usize;
        let mut files_done = 0usize;
        // Whether `latest_usage` was measured after the last batch.
        let mut probe_fresh = true;

        info!(
            "Moving files... {} selected, {} in reserve",
            plan.selected_len,
            plan.reserve().len()
        );
        reporter.on_move_start(plan.selected_len, plan.projected_reclaim_bytes());

        let stop_reason = loop {
            if ctx.is_cancelled() {
                break StopReason::Cancelled;
            }
            let estimated_remaining = needed.saturating_sub(ctx.reclaimed());
            let remaining = match (mode, ctx.latest_usage) {
                (ProbeMode::Live, Some(usage)) if probe_fresh => usage.needed_reclaim_bytes(threshold),
                _ => estimated_remaining,
            };
            if remaining == 0 {
                if mode == ProbeMode::Live && !probe_fresh {
                    info!("Completed... moved bytes cover the need but usage is unconfirmed");
                    break StopReason::EstimateReached;
                }
                info!("Completed... usage is at or below threshold ({:.3})", threshold);
                break StopReason::ThresholdReached;
            }
            if next >= candidates.len() {
                info!("Completed... No files remaining, {} bytes still needed", remaining);
                break StopReason::CandidatesExhausted;
            }

            let end = batch_end(candidates, next, self.config.batch_size, remaining);
            let batch = &candidates[next..end];
            next = end;
            debug!("Starting batch of {} file(s)", batch.len());

            let results: Vec<Option<MoveResult>> = pool.install(|| {
                batch
                    .par_iter()
                    .map(|candidate| {
                        if ctx.is_cancelled() {
                            return None;
                        }
                        let result = mover.move_file(&candidate.file);
                        if let Ok(MoveOutcome::Moved { bytes }) = &result {
                            ctx.add_reclaimed(*bytes);
                        }
                        Some(result)
                    })
                    .collect()
            });

            for (candidate, result) in batch.iter().zip(results) {
                if let Some(result) = result {
                    files_done += 1;
                    summary.record(candidate, result);
                }
            }
            reporter.on_move_progress(files_done, ctx.reclaimed());

            if mode == ProbeMode::Live {
                match self.probe.measure(&self.config.cache_root) {
                    Ok(usage) => {
                        debug!("Re-probed usage {:.3}", usage.used_fraction());
                        ctx.record_usage(usage);
                        probe_fresh = true;
                    }
                    Err(err) => {
                        warn!("Re-probe failed, continuing on estimates: {}", err);
                        probe_fresh = false;
                    }
                }
            }
        };

        summary.stop_reason = stop_reason;
        summary.final_usage = ctx.estimated_usage(mode).unwrap_or(plan.usage);
        reporter.on_move_complete(
            summary.moved,
            summary.bytes_moved,
            move_start.elapsed().as_secs_f64(),
        );
        Ok(summary)
    }
}

/// End index of the next batch: at most `batch_size` files, stopping early
/// once the batch alone covers `remaining` bytes.
fn batch_end(candidates: &[MigrationCandidate], start: usize, batch_size: usize, remaining: u64) -> usize {
    let mut end = start;
    let mut batch_bytes = 0u64;
    while end < candidates.len() && end - start < batch_size && batch_bytes < remaining {
        batch_bytes = batch_bytes.saturating_add(candidates[end].size_bytes());
        end += 1;
    }
    end
}
