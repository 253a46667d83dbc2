use std::path::Path;

use crate::commands::common::{read_attachment, resolve_report, App};
use crate::error::CliError;

pub async fn run_attach(
    id: &str,
    path: &Path,
    mime: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let app = App::open(db_path).await?;
    let report = resolve_report(id, &app.store).await?;
    let (file_name, bytes) = read_attachment(path).await?;

    let attachment = app.stager.stage(report.id, &file_name, mime, &bytes).await?;
    println!("{}", attachment.id);
    Ok(())
}
