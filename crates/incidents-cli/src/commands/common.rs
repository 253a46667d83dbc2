use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use incidents_core::db::{Database, SettingsRepository, SqliteSettingsRepository};
use incidents_core::models::{IncidentReport, Settings};
use incidents_core::store::ReportSnapshot;
use incidents_core::sync::ConnectivityMonitor;
use incidents_core::{
    ApiConfig, AttachmentStager, LocalStore, PocketBaseClient, SessionContext, SyncConfig,
    SyncEngine,
};
use serde::Serialize;

use crate::error::CliError;

/// Handles over one local database.
pub struct App {
    pub store: LocalStore,
    pub stager: AttachmentStager,
    pub sessions: SessionContext,
}

impl App {
    pub async fn open(db_path: &Path) -> Result<Self, CliError> {
        let db = Database::open(db_path)?.into_shared();
        let store = LocalStore::new(db.clone());
        let stager = store.stager(attachments_dir(db_path));
        let sessions = SessionContext::persistent(db).await?;
        Ok(Self {
            store,
            stager,
            sessions,
        })
    }

    pub async fn settings(&self) -> Result<Settings, CliError> {
        let db = self.store.database().lock().await;
        Ok(SqliteSettingsRepository::new(db.connection()).load()?)
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), CliError> {
        let db = self.store.database().lock().await;
        SqliteSettingsRepository::new(db.connection()).save(settings)?;
        Ok(())
    }

    /// Server location: the saved URL, else the environment.
    pub async fn api_config(&self) -> Result<Option<ApiConfig>, CliError> {
        let settings = self.settings().await?;
        Ok(ApiConfig::resolve(&settings, ApiConfig::from_env()?)?)
    }

    pub async fn client(&self) -> Result<PocketBaseClient, CliError> {
        let config = self.api_config().await?.ok_or(CliError::ApiNotConfigured)?;
        Ok(PocketBaseClient::new(config)?)
    }

    /// An engine over the PocketBase backend; the CLI assumes it is online.
    pub async fn engine(&self, config: SyncConfig) -> Result<SyncEngine, CliError> {
        let client = self.client().await?;
        Ok(SyncEngine::new(
            self.store.clone(),
            self.stager.clone(),
            Arc::new(client),
            self.sessions.clone(),
            ConnectivityMonitor::new(true),
            config,
        )?)
    }
}

#[derive(Debug, Serialize)]
pub struct ReportListItem {
    pub id: String,
    pub title: String,
    pub incident_type: String,
    pub status: String,
    pub sync_status: String,
    pub remote_id: Option<String>,
    pub pending_attachments: usize,
    pub failed_attachments: usize,
    pub last_error: Option<String>,
    pub updated_at: i64,
    pub relative_time: String,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or_else(|| env::var_os("INCIDENTS_DB_PATH").map(PathBuf::from))
    {
        return Ok(path);
    }
    default_db_path()
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("incidents").join("incidents.db"))
        .ok_or(CliError::DataDirUnavailable)
}

/// Attachment copies live beside the database file.
pub fn attachments_dir(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .map_or_else(|| PathBuf::from("attachments"), |dir| dir.join("attachments"))
}

pub fn normalize_report_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyReportId)
    } else {
        Ok(trimmed.to_string())
    }
}

/// Find a report by full id or unique id prefix.
pub async fn resolve_report(query: &str, store: &LocalStore) -> Result<IncidentReport, CliError> {
    let query = normalize_report_identifier(query)?;
    if let Ok(id) = query.parse() {
        if let Some(report) = store.get_report(&id).await? {
            if !report.is_deleted {
                return Ok(report);
            }
        }
    }

    let mut matching = store
        .list_reports()
        .await?
        .into_iter()
        .filter(|report| report.id.as_str().starts_with(&query))
        .collect::<Vec<_>>();

    match matching.len() {
        0 => Err(CliError::ReportNotFound(query)),
        1 => Ok(matching.remove(0)),
        _ => {
            let options = matching
                .iter()
                .take(3)
                .map(|report| short_id(&report.id.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousReportId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn format_report_lines(snapshots: &[ReportSnapshot]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    snapshots
        .iter()
        .map(|snapshot| {
            let report = &snapshot.report;
            let short_id = short_id(&report.id.as_str());
            let title = truncate(&report.fields.title, 40);
            let relative_time = format_relative_time(report.updated_at, now_ms);
            let mut line = format!(
                "{short_id:<13}  {title:<40}  {:<14}  {relative_time}",
                report.sync_status.as_str()
            );
            if snapshot.pending_attachments > 0 {
                line.push_str(&format!("  [{} to upload]", snapshot.pending_attachments));
            }
            if let Some(error) = &report.last_error {
                line.push_str(&format!("  ! {}", truncate(error, 60)));
            }
            line
        })
        .collect()
}

pub fn report_to_list_item(snapshot: &ReportSnapshot) -> ReportListItem {
    let report = &snapshot.report;
    ReportListItem {
        id: report.id.to_string(),
        title: report.fields.title.clone(),
        incident_type: report.fields.incident_type.clone(),
        status: report.fields.status.as_str().to_string(),
        sync_status: report.sync_status.as_str().to_string(),
        remote_id: report.remote_id.clone(),
        pending_attachments: snapshot.pending_attachments,
        failed_attachments: snapshot.failed_attachments,
        last_error: report.last_error.clone(),
        updated_at: report.updated_at,
        relative_time: format_relative_time(report.updated_at, Utc::now().timestamp_millis()),
    }
}

pub fn truncate(value: &str, max_chars: usize) -> String {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let mut truncated = collapsed
            .chars()
            .take(max_chars.saturating_sub(3))
            .collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format_timestamp(timestamp_ms)
    }
}

/// Read a file to stage it as an attachment.
pub async fn read_attachment(path: &Path) -> Result<(String, Vec<u8>), CliError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CliError::NotAFile(path.display().to_string()))?
        .to_string();
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(CliError::NotAFile(path.display().to_string()));
    }
    let bytes = tokio::fs::read(path).await?;
    Ok((file_name, bytes))
}
