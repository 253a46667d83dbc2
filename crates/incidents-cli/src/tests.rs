use std::collections::BTreeMap;

use clap::Parser;
use incidents_core::models::IncidentStatus;
use incidents_core::{DrainReport, ReportDraft, SyncStatus};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

use crate::cli::{Cli, Commands, ConflictSide};
use crate::commands::common::{
    attachments_dir, format_relative_time, normalize_report_identifier, resolve_report,
    short_id, truncate, App,
};
use crate::commands::create::build_draft;
use crate::commands::edit::build_patch;
use crate::commands::resolve::conflict_choice;
use crate::commands::status::{format_status_lines, StatusSummary};
use crate::commands::sync::format_drain_report;
use crate::error::CliError;

#[test]
fn format_relative_time_units() {
    let now = 10_000_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now), "3d ago");
}

#[test]
fn truncate_collapses_whitespace_and_shortens() {
    assert_eq!(truncate("  Fallen   tree  ", 40), "Fallen tree");
    assert_eq!(truncate(&"x".repeat(50), 10), "xxxxxxx...");
}

#[test]
fn normalize_report_identifier_rejects_blank() {
    assert!(matches!(
        normalize_report_identifier("   "),
        Err(CliError::EmptyReportId)
    ));
    assert_eq!(normalize_report_identifier(" 0192ab ").unwrap(), "0192ab");
}

#[test]
fn attachments_live_next_to_database() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("incidents.db");
    assert_eq!(attachments_dir(&db_path), dir.path().join("attachments"));
}

#[test]
fn create_args_build_a_full_draft() {
    let cli = Cli::try_parse_from([
        "incidents",
        "create",
        "House",
        "fire",
        "--type",
        "Fire",
        "--status",
        "ongoing",
        "--lat",
        "14.5995",
        "--lon",
        "120.9842",
        "-d",
        "Two-storey house",
    ])
    .unwrap();
    let Commands::Create(args) = cli.command else {
        panic!("expected create");
    };

    let fields = build_draft(&args).unwrap().into_fields(0).unwrap();
    assert_eq!(fields.title, "House fire");
    assert_eq!(fields.incident_type, "Fire");
    assert_eq!(fields.status, IncidentStatus::Ongoing);
    assert_eq!(fields.description, "Two-storey house");
    assert_eq!(fields.location.unwrap().longitude, 120.9842);
}

#[test]
fn create_rejects_half_a_location() {
    let parsed = Cli::try_parse_from(["incidents", "create", "Flood", "--lat", "10.0"]);
    assert!(parsed.is_err());
}

#[test]
fn edit_args_build_patch() {
    let cli = Cli::try_parse_from([
        "incidents",
        "edit",
        "0192",
        "--status",
        "resolved",
        "--clear-location",
    ])
    .unwrap();
    let Commands::Edit(args) = cli.command else {
        panic!("expected edit");
    };

    let patch = build_patch(&args).unwrap();
    assert_eq!(patch.status, Some(IncidentStatus::Resolved));
    assert_eq!(patch.location, Some(None));
    assert_eq!(patch.title, None);
}

#[test]
fn edit_without_fields_is_empty() {
    let cli = Cli::try_parse_from(["incidents", "edit", "0192"]).unwrap();
    let Commands::Edit(args) = cli.command else {
        panic!("expected edit");
    };
    assert!(build_patch(&args).unwrap().is_empty());
}

#[test]
fn list_accepts_hyphenated_status() {
    let cli = Cli::try_parse_from(["incidents", "list", "--status", "pending-create"]).unwrap();
    let Commands::List { status, .. } = cli.command else {
        panic!("expected list");
    };
    assert_eq!(status, Some(SyncStatus::PendingCreate));
}

#[test]
fn resolve_side_maps_to_choice() {
    assert_eq!(
        conflict_choice(ConflictSide::Local),
        incidents_core::ConflictChoice::KeepLocal
    );
    assert_eq!(
        conflict_choice(ConflictSide::Remote),
        incidents_core::ConflictChoice::KeepRemote
    );
}

#[test]
fn drain_report_summary_lines() {
    assert_eq!(
        format_drain_report(&DrainReport::default()),
        vec!["Nothing to sync".to_string()]
    );

    let report = DrainReport {
        dispatched: 3,
        acked: 1,
        uploaded: 1,
        conflicted: 1,
        ..DrainReport::default()
    };
    let lines = format_drain_report(&report);
    assert_eq!(
        lines[0],
        "Sent 3 operation(s): 1 acknowledged, 1 uploaded, 0 merged"
    );
    assert!(lines[1].starts_with("1 report(s) need a conflict resolution"));
}

#[test]
fn status_lines_show_counts() {
    let summary = StatusSummary {
        logged_in_as: None,
        server: Some("https://pb.example.com".to_string()),
        reports: BTreeMap::from([("pending_create".to_string(), 2), ("synced".to_string(), 1)]),
        pending_operations: Vec::new(),
    };
    assert_eq!(
        format_status_lines(&summary),
        vec![
            "session: not logged in".to_string(),
            "server:  https://pb.example.com".to_string(),
            "reports: pending_create=2 synced=1".to_string(),
            "queue:   0 pending".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn resolve_report_by_prefix() {
    let dir = tempdir().unwrap();
    let app = App::open(&dir.path().join("incidents.db")).await.unwrap();
    let report = app
        .store
        .create_report(ReportDraft::new("Landslide"))
        .await
        .unwrap();

    let id = report.id.as_str();
    let by_full = resolve_report(&id, &app.store).await.unwrap();
    assert_eq!(by_full.id, report.id);

    let by_prefix = resolve_report(&short_id(&id), &app.store).await.unwrap();
    assert_eq!(by_prefix.id, report.id);

    assert!(matches!(
        resolve_report("ffffffff-dead", &app.store).await,
        Err(CliError::ReportNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn resolve_report_reports_ambiguous_prefix() {
    let dir = tempdir().unwrap();
    let app = App::open(&dir.path().join("incidents.db")).await.unwrap();
    for title in ["First", "Second"] {
        app.store.create_report(ReportDraft::new(title)).await.unwrap();
    }

    // v7 ids created in the same millisecond share a long prefix
    let result = resolve_report("0", &app.store).await;
    assert!(matches!(result, Err(CliError::AmbiguousReportId(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn deleted_reports_are_not_resolvable() {
    let dir = tempdir().unwrap();
    let app = App::open(&dir.path().join("incidents.db")).await.unwrap();
    let report = app
        .store
        .create_report(ReportDraft::new("Mistake"))
        .await
        .unwrap();
    app.store.delete_report(&report.id).await.unwrap();

    assert!(matches!(
        resolve_report(&report.id.as_str(), &app.store).await,
        Err(CliError::ReportNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn settings_round_trip_through_app() {
    let dir = tempdir().unwrap();
    let app = App::open(&dir.path().join("incidents.db")).await.unwrap();

    let mut settings = app.settings().await.unwrap();
    settings.api_base_url = Some("https://pb.example.com".to_string());
    app.save_settings(&settings).await.unwrap();

    let config = app.api_config().await.unwrap().unwrap();
    assert_eq!(config.base_url, "https://pb.example.com");
}
