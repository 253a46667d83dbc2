use std::path::Path;

use incidents_core::sync::DrainStop;
use incidents_core::{DrainReport, SyncConfig, SyncWorker};

use crate::commands::common::App;
use crate::error::CliError;

pub async fn run_sync(watch: bool, db_path: &Path) -> Result<(), CliError> {
    let app = App::open(db_path).await?;
    if !app.sessions.is_active().await {
        return Err(CliError::NotLoggedIn);
    }
    if watch {
        return run_sync_watch(&app).await;
    }

    let engine = app.engine(SyncConfig::default().without_auto_sync()).await?;
    let report = engine.drain().await?;
    engine.stager().discard_orphans().await?;

    for line in format_drain_report(&report) {
        println!("{line}");
    }
    if report.stopped == Some(DrainStop::Unauthorized) {
        return Err(CliError::NotLoggedIn);
    }
    Ok(())
}

async fn run_sync_watch(app: &App) -> Result<(), CliError> {
    let engine = app.engine(SyncConfig::default()).await?;
    let worker = SyncWorker::spawn(engine.clone());
    println!("Syncing in the background; press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    worker.shutdown().await;

    let pending = engine.queue().pending_count().await?;
    println!("Stopped with {pending} operation(s) pending");
    Ok(())
}

pub fn format_drain_report(report: &DrainReport) -> Vec<String> {
    let mut lines = Vec::new();
    if report.dispatched == 0 && report.stopped.is_none() {
        lines.push("Nothing to sync".to_string());
        return lines;
    }

    lines.push(format!(
        "Sent {} operation(s): {} acknowledged, {} uploaded, {} merged",
        report.dispatched, report.acked, report.uploaded, report.merged
    ));
    if report.retried > 0 {
        lines.push(format!("{} will be retried later", report.retried));
    }
    if report.conflicted > 0 {
        lines.push(format!(
            "{} report(s) need a conflict resolution (see `incidents list --status conflict`)",
            report.conflicted
        ));
    }
    if report.abandoned > 0 {
        lines.push(format!(
            "{} operation(s) failed (see `incidents list --status failed`)",
            report.abandoned
        ));
    }
    if report.purged_files > 0 {
        lines.push(format!("Removed {} uploaded local file(s)", report.purged_files));
    }
    if let Some(stop) = report.stopped {
        lines.push(format!("Stopped early: {}", describe_stop(stop)));
    }
    lines
}

const fn describe_stop(stop: DrainStop) -> &'static str {
    match stop {
        DrainStop::Offline => "offline",
        DrainStop::NoSession => "not logged in",
        DrainStop::Unauthorized => "the server rejected the session; log in again",
        DrainStop::Cancelled => "cancelled",
        DrainStop::Busy => "another sync is running",
        DrainStop::LocalError => "local storage error",
    }
}
