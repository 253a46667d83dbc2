use std::path::Path;

use incidents_core::models::Location;
use incidents_core::ReportDraft;

use crate::cli::CreateArgs;
use crate::commands::common::{read_attachment, App};
use crate::error::CliError;

pub async fn run_create(args: CreateArgs, db_path: &Path) -> Result<(), CliError> {
    let draft = build_draft(&args)?;
    let app = App::open(db_path).await?;
    let report = app.store.create_report(draft).await?;

    for path in &args.attachments {
        let (file_name, bytes) = read_attachment(path).await?;
        app.stager.stage(report.id, &file_name, None, &bytes).await?;
    }

    println!("{}", report.id);
    Ok(())
}

pub fn build_draft(args: &CreateArgs) -> Result<ReportDraft, CliError> {
    let mut draft = ReportDraft::new(args.title.join(" "));
    if let Some(description) = &args.description {
        draft = draft.with_description(description.as_str());
    }
    if let Some(incident_type) = &args.incident_type {
        draft = draft.with_type(incident_type.as_str());
    }
    if let Some(status) = args.status {
        draft = draft.with_status(status);
    }
    if let (Some(latitude), Some(longitude)) = (args.lat, args.lon) {
        draft = draft.with_location(Location::new(latitude, longitude)?);
    }
    Ok(draft)
}
