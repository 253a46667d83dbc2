use std::path::Path;

use crate::commands::common::{resolve_report, App};
use crate::error::CliError;

pub async fn run_delete(id: &str, db_path: &Path) -> Result<(), CliError> {
    let app = App::open(db_path).await?;
    let report = resolve_report(id, &app.store).await?;

    app.store.delete_report(&report.id).await?;
    app.stager.discard_orphans().await?;
    println!("{}", report.id);
    Ok(())
}
