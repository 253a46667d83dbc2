//! Row mapping shared by the local store, sync queue and attachment stager.
//!
//! All helpers take `&Connection` so they run equally on a plain connection
//! or inside a `Transaction`.

use std::path::PathBuf;
use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::models::{
    Attachment, AttachmentId, ErrorKind, IdempotencyToken, IncidentReport, IncidentStatus,
    Location, OperationId, OperationKind, OperationTarget, ReportFields, ReportId, SyncOperation,
    UploadStatus,
};

pub const REPORT_COLUMNS: &str = "id, remote_id, idempotency_token, title, description, \
     incident_type, status, latitude, longitude, occurred_at, attachments, sync_status, \
     revision, remote_revision, synced_fields, conflict, last_error, is_deleted, created_at, \
     updated_at";

pub const ATTACHMENT_COLUMNS: &str = "id, report_id, file_name, mime_type, local_path, \
     size_bytes, remote_url, upload_status, last_error, created_at, updated_at";

pub const OPERATION_COLUMNS: &str = "seq, id, entity_id, report_id, kind, payload, \
     base_revision, attempts, next_eligible_at, last_error_kind, last_error, created_at";

fn conversion_error(
    idx: usize,
    error: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(error))
}

fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|error| conversion_error(idx, error))
}

fn parse_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(|error| conversion_error(idx, error)))
        .transpose()
}

fn to_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>> {
    Ok(value.map(serde_json::to_string).transpose()?)
}

pub fn parse_report(row: &Row<'_>) -> rusqlite::Result<IncidentReport> {
    let latitude: Option<f64> = row.get(7)?;
    let longitude: Option<f64> = row.get(8)?;
    let location = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(Location {
            latitude,
            longitude,
        }),
        _ => None,
    };
    let status: IncidentStatus = parse_text(row, 6)?;

    Ok(IncidentReport {
        id: parse_text(row, 0)?,
        remote_id: row.get(1)?,
        idempotency_token: IdempotencyToken::parse(row.get::<_, String>(2)?)
            .map_err(|error| conversion_error(2, error))?,
        fields: ReportFields {
            title: row.get(3)?,
            description: row.get(4)?,
            incident_type: row.get(5)?,
            status,
            location,
            occurred_at: row.get(9)?,
        },
        attachments: parse_json(row, 10)?.unwrap_or_default(),
        sync_status: parse_text(row, 11)?,
        revision: row.get(12)?,
        remote_revision: row.get(13)?,
        synced_fields: parse_json(row, 14)?,
        conflict: parse_json(row, 15)?,
        last_error: row.get(16)?,
        is_deleted: row.get::<_, i32>(17)? != 0,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

pub fn get_report(conn: &Connection, id: &ReportId) -> Result<Option<IncidentReport>> {
    let report = conn
        .query_row(
            &format!("SELECT {REPORT_COLUMNS} FROM reports WHERE id = ?"),
            params![id.as_str()],
            parse_report,
        )
        .optional()?;
    Ok(report)
}

pub fn upsert_report(conn: &Connection, report: &IncidentReport) -> Result<()> {
    debug_assert!(report.is_consistent(), "remote id invariant violated");

    let fields = &report.fields;
    conn.execute(
        &format!(
            "INSERT INTO reports ({REPORT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
             ON CONFLICT(id) DO UPDATE SET
                remote_id = excluded.remote_id,
                title = excluded.title,
                description = excluded.description,
                incident_type = excluded.incident_type,
                status = excluded.status,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                occurred_at = excluded.occurred_at,
                attachments = excluded.attachments,
                sync_status = excluded.sync_status,
                revision = excluded.revision,
                remote_revision = excluded.remote_revision,
                synced_fields = excluded.synced_fields,
                conflict = excluded.conflict,
                last_error = excluded.last_error,
                is_deleted = excluded.is_deleted,
                updated_at = excluded.updated_at"
        ),
        params![
            report.id.as_str(),
            report.remote_id,
            report.idempotency_token.as_str(),
            fields.title,
            fields.description,
            fields.incident_type,
            fields.status.as_str(),
            fields.location.map(|location| location.latitude),
            fields.location.map(|location| location.longitude),
            fields.occurred_at,
            serde_json::to_string(&report.attachments)?,
            report.sync_status.as_str(),
            report.revision,
            report.remote_revision,
            to_json(report.synced_fields.as_ref())?,
            to_json(report.conflict.as_ref())?,
            report.last_error,
            i32::from(report.is_deleted),
            report.created_at,
            report.updated_at,
        ],
    )?;
    Ok(())
}

pub fn delete_report(conn: &Connection, id: &ReportId) -> Result<()> {
    conn.execute("DELETE FROM reports WHERE id = ?", params![id.as_str()])?;
    Ok(())
}

pub fn parse_attachment(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    let local_path: Option<String> = row.get(4)?;
    Ok(Attachment {
        id: parse_text(row, 0)?,
        report_id: parse_text(row, 1)?,
        file_name: row.get(2)?,
        mime_type: row.get(3)?,
        local_path: local_path.map(PathBuf::from),
        size_bytes: row.get(5)?,
        remote_url: row.get(6)?,
        upload_status: parse_text(row, 7)?,
        last_error: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub fn get_attachment(conn: &Connection, id: &AttachmentId) -> Result<Option<Attachment>> {
    let attachment = conn
        .query_row(
            &format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = ?"),
            params![id.as_str()],
            parse_attachment,
        )
        .optional()?;
    Ok(attachment)
}

pub fn list_attachments(conn: &Connection, report_id: &ReportId) -> Result<Vec<Attachment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE report_id = ? ORDER BY created_at, id"
    ))?;
    let attachments = stmt
        .query_map(params![report_id.as_str()], parse_attachment)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(attachments)
}

pub fn upsert_attachment(conn: &Connection, attachment: &Attachment) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO attachments ({ATTACHMENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                local_path = excluded.local_path,
                remote_url = excluded.remote_url,
                upload_status = excluded.upload_status,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at"
        ),
        params![
            attachment.id.as_str(),
            attachment.report_id.as_str(),
            attachment.file_name,
            attachment.mime_type,
            attachment
                .local_path
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
            attachment.size_bytes,
            attachment.remote_url,
            attachment.upload_status.as_str(),
            attachment.last_error,
            attachment.created_at,
            attachment.updated_at,
        ],
    )?;
    Ok(())
}

pub fn set_upload_status(
    conn: &Connection,
    id: &AttachmentId,
    status: UploadStatus,
    error: Option<&str>,
    now: i64,
) -> Result<usize> {
    let rows = conn.execute(
        "UPDATE attachments SET upload_status = ?, last_error = ?, updated_at = ? WHERE id = ?",
        params![status.as_str(), error, now, id.as_str()],
    )?;
    Ok(rows)
}

pub fn parse_operation(row: &Row<'_>) -> rusqlite::Result<SyncOperation> {
    let entity_id: String = row.get(2)?;
    let report_id: ReportId = parse_text(row, 3)?;
    let kind: OperationKind = parse_text(row, 4)?;
    let target = if kind == OperationKind::Upload {
        OperationTarget::Attachment {
            attachment: entity_id
                .parse()
                .map_err(|error| conversion_error(2, error))?,
            report: report_id,
        }
    } else {
        OperationTarget::Report(report_id)
    };
    let last_error_kind: Option<String> = row.get(9)?;

    Ok(SyncOperation {
        seq: row.get(0)?,
        id: parse_text::<OperationId>(row, 1)?,
        target,
        kind,
        payload: parse_json(row, 5)?,
        base_revision: row.get(6)?,
        attempts: row.get(7)?,
        next_eligible_at: row.get(8)?,
        last_error_kind: last_error_kind
            .map(|raw| ErrorKind::from_str(&raw))
            .transpose()
            .map_err(|error| conversion_error(9, error))?,
        last_error: row.get(10)?,
        created_at: row.get(11)?,
    })
}

