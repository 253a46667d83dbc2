use std::path::Path;

use incidents_core::models::Location;
use incidents_core::ReportPatch;

use crate::cli::EditArgs;
use crate::commands::common::{resolve_report, App};
use crate::error::CliError;

pub async fn run_edit(args: EditArgs, db_path: &Path) -> Result<(), CliError> {
    let patch = build_patch(&args)?;
    if patch.is_empty() {
        return Err(CliError::EmptyEdit);
    }

    let app = App::open(db_path).await?;
    let report = resolve_report(&args.id, &app.store).await?;
    let updated = app.store.update_report(&report.id, patch).await?;
    println!("{}", updated.id);
    Ok(())
}

pub fn build_patch(args: &EditArgs) -> Result<ReportPatch, CliError> {
    let location = if args.clear_location {
        Some(None)
    } else if let (Some(latitude), Some(longitude)) = (args.lat, args.lon) {
        Some(Some(Location::new(latitude, longitude)?))
    } else {
        None
    };
    Ok(ReportPatch {
        title: args.title.clone(),
        description: args.description.clone(),
        incident_type: args.incident_type.clone(),
        status: args.status,
        location,
        occurred_at: None,
    })
}
