mod cli;
mod logging;
mod progress;

use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use cli::Cli;
use colored::*;
use dotenv::dotenv;
use progress::CliReporter;
use snapmover_core::config::{load_configuration, AppConfig};
use snapmover_core::{
    MoveEngine, MoverConfig, PlanResult, RsyncTransfer, RunOutcome, StatvfsProbe, StopReason,
};
use tracing::{error, info, warn};

fn main() {
    dotenv().ok();

    let args = Cli::parse();
    let _guard = logging::init_logger(args.log_level.as_deref(), args.log_file.as_deref());

    if let Err(err) = run(&args) {
        error!("{:#}", err);
        process::exit(1);
    }
}

fn run(args: &Cli) -> Result<()> {
    let app = load_configuration(args.config.as_deref()).context("Error loading configuration")?;
    let config = build_config(args, &app);

    let transfer = RsyncTransfer::from_config(&app);
    let engine = MoveEngine::new(config)
        .with_probe(Arc::new(StatvfsProbe::new(app.require_mount_point)))
        .with_transfer(Arc::new(transfer));

    let cancel = engine.cancel_token();
    ctrlc::set_handler(move || {
        warn!("Interrupted, stopping after in-flight transfers finish");
        cancel.store(true, Ordering::SeqCst);
    })
    .context("Error installing interrupt handler")?;

    let reporter = CliReporter::new();
    let outcome = engine.run(&reporter)?;

    if engine.config().audit {
        print_plan(&outcome.plan);
    }
    print_summary(&outcome);
    Ok(())
}

/// Layer command line flags over the file/environment configuration.
fn build_config(args: &Cli, app: &AppConfig) -> MoverConfig {
    let mut config = MoverConfig::new(&args.cache, &args.backing, args.threshold)
        .with_app_config(app)
        .with_audit(args.audit)
        .with_force_rescan(args.rescan);

    if let Some(path) = &args.metadata {
        config = config.with_metadata_path(Some(path.clone()));
    }
    let batch_size = args.batch_size.unwrap_or(config.batch_size);
    let jobs = args.jobs.unwrap_or(config.max_transfers);
    config = config.with_batching(batch_size, jobs);
    if let Some(mode) = args.probe {
        config = config.with_probe_mode(mode);
    }
    config
}

fn format_access(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn print_plan(plan: &PlanResult) {
    if plan.is_empty() {
        info!("AUDIT: nothing to move");
        return;
    }
    for candidate in plan.selected() {
        let group = if candidate.is_pinned() {
            "pinned".yellow()
        } else {
            "unpinned".green()
        };
        info!(
            "AUDIT: {} {} bytes, last access {} [{}]",
            candidate.file.relative_path.display(),
            candidate.size_bytes(),
            format_access(candidate.file.last_access),
            group
        );
    }
    info!(
        "AUDIT: {} file(s), {} bytes, {} pinned; projected usage {}",
        plan.selected_len,
        plan.projected_reclaim_bytes(),
        plan.selected_pinned_count(),
        format!("{:.3}", plan.projected_usage()).cyan()
    );
}

fn print_summary(outcome: &RunOutcome) {
    let summary = &outcome.summary;
    let plan = &outcome.plan;

    println!();
    info!(
        "Usage {} -> {} (threshold {})",
        format!("{:.3}", plan.usage.used_fraction()).yellow(),
        format!("{:.3}", summary.final_usage.used_fraction()).green(),
        format!("{:.3}", plan.threshold).cyan(),
    );
    if outcome.index_stats.is_some() {
        info!(
            "{} candidates ({} unpinned, {} pinned), {} bytes held outside live files",
            plan.candidates.len(),
            format!("{}", plan.unpinned_count()).green(),
            format!("{}", plan.pinned_count()).yellow(),
            outcome.snapshot_held_bytes(),
        );
    }
    if summary.stop_reason == StopReason::Audit || summary.stop_reason == StopReason::NothingToDo {
        info!("Stopped: {:?} in {:.2}s", summary.stop_reason, summary.duration.as_secs_f64());
        return;
    }

    info!(
        "{} moved ({} bytes), {} skipped, {} failed, {} partial",
        format!("{}", summary.moved).green(),
        format!("{}", summary.bytes_moved).green(),
        summary.skipped,
        format!("{}", summary.failed).red(),
        format!("{}", summary.partial).red(),
    );
    for failure in &summary.failures {
        warn!("{}", failure);
    }
    info!("Stopped: {:?} in {:.2}s", summary.stop_reason, summary.duration.as_secs_f64());
}
