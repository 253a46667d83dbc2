use std::path::Path;

use incidents_core::SyncStatus;

use crate::commands::common::{format_report_lines, report_to_list_item, App, ReportListItem};
use crate::error::CliError;

pub async fn run_list(
    status: Option<SyncStatus>,
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let app = App::open(db_path).await?;
    let snapshots = app
        .store
        .snapshot()
        .await?
        .into_iter()
        .filter(|snapshot| status.is_none() || status == Some(snapshot.report.sync_status))
        .take(limit)
        .collect::<Vec<_>>();

    if as_json {
        let json_items = snapshots
            .iter()
            .map(report_to_list_item)
            .collect::<Vec<ReportListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if snapshots.is_empty() {
        println!("No reports.");
    } else {
        for line in format_report_lines(&snapshots) {
            println!("{line}");
        }
    }

    Ok(())
}
