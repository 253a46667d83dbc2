use std::path::Path;

use crate::commands::common::{resolve_report, App};
use crate::error::CliError;

pub async fn run_retry(id: &str, db_path: &Path) -> Result<(), CliError> {
    let app = App::open(db_path).await?;
    let report = resolve_report(id, &app.store).await?;

    let retried = app.store.retry(&report.id).await?;
    println!("{}  {}", retried.id, retried.sync_status);
    Ok(())
}
