use std::path::Path;

use incidents_core::ConflictChoice;

use crate::cli::ConflictSide;
use crate::commands::common::{resolve_report, App};
use crate::error::CliError;

pub async fn run_resolve(id: &str, keep: ConflictSide, db_path: &Path) -> Result<(), CliError> {
    let app = App::open(db_path).await?;
    let report = resolve_report(id, &app.store).await?;

    let resolved = app
        .store
        .resolve_conflict(&report.id, conflict_choice(keep))
        .await?;
    println!("{}  {}", resolved.id, resolved.sync_status);
    Ok(())
}

pub const fn conflict_choice(side: ConflictSide) -> ConflictChoice {
    match side {
        ConflictSide::Local => ConflictChoice::KeepLocal,
        ConflictSide::Remote => ConflictChoice::KeepRemote,
    }
}
