use std::collections::BTreeMap;
use std::path::Path;

use incidents_core::models::{OperationTarget, SyncOperation};
use serde::Serialize;

use crate::commands::common::{format_timestamp, short_id, App};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub logged_in_as: Option<String>,
    pub server: Option<String>,
    pub reports: BTreeMap<String, usize>,
    pub pending_operations: Vec<OperationItem>,
}

#[derive(Debug, Serialize)]
pub struct OperationItem {
    pub id: String,
    pub kind: String,
    pub entity: String,
    pub attempts: u32,
    pub next_eligible_at: i64,
    pub last_error: Option<String>,
}

pub async fn run_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let app = App::open(db_path).await?;
    let session = app.sessions.current().await;
    let server = app.api_config().await?.map(|config| config.base_url);

    let mut reports = BTreeMap::new();
    for report in app.store.list_reports().await? {
        *reports
            .entry(report.sync_status.as_str().to_string())
            .or_insert(0) += 1;
    }
    let pending_operations = app
        .store
        .queue()
        .list()
        .await?
        .iter()
        .map(operation_to_item)
        .collect::<Vec<_>>();

    let summary = StatusSummary {
        logged_in_as: session.map(|session| session.full_name),
        server,
        reports,
        pending_operations,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for line in format_status_lines(&summary) {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn operation_to_item(op: &SyncOperation) -> OperationItem {
    let entity = match op.target {
        OperationTarget::Report(id) => format!("report {}", short_id(&id.as_str())),
        OperationTarget::Attachment { attachment, .. } => {
            format!("attachment {}", short_id(&attachment.as_str()))
        }
    };
    OperationItem {
        id: op.id.to_string(),
        kind: op.kind.as_str().to_string(),
        entity,
        attempts: op.attempts,
        next_eligible_at: op.next_eligible_at,
        last_error: op.last_error.clone(),
    }
}

pub fn format_status_lines(summary: &StatusSummary) -> Vec<String> {
    let mut lines = vec![
        format!(
            "session: {}",
            summary.logged_in_as.as_deref().unwrap_or("not logged in")
        ),
        format!(
            "server:  {}",
            summary.server.as_deref().unwrap_or("not configured")
        ),
    ];
    if summary.reports.is_empty() {
        lines.push("reports: none".to_string());
    } else {
        let counts = summary
            .reports
            .iter()
            .map(|(status, count)| format!("{status}={count}"))
            .collect::<Vec<_>>()
            .join(" ");
        lines.push(format!("reports: {counts}"));
    }
    lines.push(format!("queue:   {} pending", summary.pending_operations.len()));
    for op in &summary.pending_operations {
        let mut line = format!("  {:<7} {:<25} attempts={}", op.kind, op.entity, op.attempts);
        if op.attempts > 0 {
            line.push_str(&format!(" next={}", format_timestamp(op.next_eligible_at)));
        }
        if let Some(error) = &op.last_error {
            line.push_str(&format!(" error={error}"));
        }
        lines.push(line);
    }
    lines
}
