use std::path::Path;

use incidents_core::models::{Attachment, IncidentReport, ReportField, ReportFields};
use serde::Serialize;

use crate::commands::common::{format_timestamp, resolve_report, App};
use crate::error::CliError;

#[derive(Serialize)]
struct ReportDetails<'a> {
    report: &'a IncidentReport,
    attachments: &'a [Attachment],
}

pub async fn run_show(id: &str, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let app = App::open(db_path).await?;
    let report = resolve_report(id, &app.store).await?;
    let attachments = app.stager.list_for_report(&report.id).await?;

    if as_json {
        let details = ReportDetails {
            report: &report,
            attachments: &attachments,
        };
        println!("{}", serde_json::to_string_pretty(&details)?);
        return Ok(());
    }

    for line in format_report_details(&report, &attachments) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_report_details(report: &IncidentReport, attachments: &[Attachment]) -> Vec<String> {
    let fields = &report.fields;
    let mut lines = vec![
        format!("id:          {}", report.id),
        format!("title:       {}", fields.title),
        format!("type:        {}", fields.incident_type),
        format!("status:      {}", fields.status.as_str()),
        format!("occurred:    {}", format_timestamp(fields.occurred_at)),
    ];
    if let Some(location) = fields.location {
        lines.push(format!(
            "location:    {:.6}, {:.6}",
            location.latitude, location.longitude
        ));
    }
    if !fields.description.is_empty() {
        lines.push(format!("description: {}", fields.description));
    }
    lines.push(format!("sync:        {}", report.sync_status));
    if let Some(remote_id) = &report.remote_id {
        lines.push(format!("remote id:   {remote_id}"));
    }
    if let Some(error) = &report.last_error {
        lines.push(format!("last error:  {error}"));
    }
    if let Some(conflict) = &report.conflict {
        for field in &conflict.fields {
            lines.push(format!(
                "conflict:    {field}: local={:?} remote={:?}",
                field_value(&conflict.local, *field),
                field_value(&conflict.remote.fields, *field)
            ));
        }
    }
    for attachment in attachments {
        let mut line = format!(
            "attachment:  {} ({}, {} bytes) {}",
            attachment.file_name,
            attachment.mime_type,
            attachment.size_bytes,
            attachment.upload_status.as_str()
        );
        if let Some(url) = &attachment.remote_url {
            line.push(' ');
            line.push_str(url);
        }
        lines.push(line);
    }
    lines
}

fn field_value(fields: &ReportFields, field: ReportField) -> String {
    match field {
        ReportField::Title => fields.title.clone(),
        ReportField::Description => fields.description.clone(),
        ReportField::IncidentType => fields.incident_type.clone(),
        ReportField::Status => fields.status.as_str().to_string(),
        ReportField::Location => fields.location.map_or_else(String::new, |location| {
            format!("{:.6}, {:.6}", location.latitude, location.longitude)
        }),
        ReportField::OccurredAt => format_timestamp(fields.occurred_at),
    }
}
