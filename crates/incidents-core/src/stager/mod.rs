//! Managed local storage for attachment bytes.
//!
//! Bytes are copied under the stager's root directory before any network
//! activity, so the caller's original file can go away. Local copies are only
//! removed by [`AttachmentStager::purge`] (report synced, every attachment
//! uploaded) or [`AttachmentStager::discard_orphans`] (owning report gone).

use std::path::{Path, PathBuf};

use crate::db::rows::{
    get_attachment, get_report, list_attachments, parse_attachment, set_upload_status,
    upsert_attachment, upsert_report, ATTACHMENT_COLUMNS,
};
use crate::db::SharedDatabase;
use crate::error::{Error, Result};
use crate::models::{
    Attachment, AttachmentId, OperationTarget, ReportId, SyncStatus, UploadStatus,
};
use crate::queue::{enqueue_in, NewOperation};
use crate::store::ChangeFeed;
use crate::util::now_millis;

const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// Copies attachment bytes into managed storage and tracks their upload state.
#[derive(Clone)]
pub struct AttachmentStager {
    db: SharedDatabase,
    root: PathBuf,
    changes: ChangeFeed,
}

impl AttachmentStager {
    pub fn new(db: SharedDatabase, root: impl Into<PathBuf>) -> Self {
        Self::with_changes(db, root, ChangeFeed::default())
    }

    pub(crate) fn with_changes(
        db: SharedDatabase,
        root: impl Into<PathBuf>,
        changes: ChangeFeed,
    ) -> Self {
        Self {
            db,
            root: root.into(),
            changes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy `bytes` into managed storage and attach them to a report.
    ///
    /// The returned attachment is `Pending`. If the report already exists on
    /// the server the upload is queued right away; otherwise it is queued when
    /// the report's create is acknowledged.
    pub async fn stage(
        &self,
        report_id: ReportId,
        file_name: &str,
        mime_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<Attachment> {
        let file_name = sanitize_file_name(file_name);
        let mime_type = mime_type
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map_or_else(
                || {
                    mime_guess::from_path(&file_name)
                        .first_raw()
                        .unwrap_or(FALLBACK_MIME_TYPE)
                        .to_string()
                },
                str::to_string,
            );
        let size = i64::try_from(bytes.len())
            .map_err(|_| Error::InvalidInput("Attachment is too large".to_string()))?;
        let mut attachment = Attachment::new(report_id, file_name, mime_type, size)?;

        let path = self.path_for(&attachment);
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, bytes).await?;
        attachment.local_path = Some(path.clone());

        match self.register(&attachment).await {
            Ok(()) => {
                tracing::debug!(
                    attachment = %attachment.id,
                    report = %report_id,
                    size,
                    "Staged attachment"
                );
                self.changes.notify();
                Ok(attachment)
            }
            Err(error) => {
                if let Err(remove_error) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), %remove_error, "Failed to remove staged file");
                }
                Err(error)
            }
        }
    }

    async fn register(&self, attachment: &Attachment) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let mut report = get_report(&tx, &attachment.report_id)?
            .filter(|report| !report.is_deleted)
            .ok_or_else(|| Error::NotFound(format!("report {}", attachment.report_id)))?;

        upsert_attachment(&tx, attachment)?;
        report.attachments.push(attachment.id);
        report.updated_at = now_millis();
        upsert_report(&tx, &report)?;

        if report.remote_id.is_some() && report.sync_status != SyncStatus::Failed {
            enqueue_in(
                &tx,
                NewOperation::upload(OperationTarget::Attachment {
                    attachment: attachment.id,
                    report: report.id,
                }),
                now_millis(),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn path_for(&self, attachment: &Attachment) -> PathBuf {
        let extension = Path::new(&attachment.file_name)
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| format!(".{}", value.to_ascii_lowercase()))
            .unwrap_or_default();
        self.root.join(format!("{}{extension}", attachment.id))
    }

    pub async fn get(&self, id: &AttachmentId) -> Result<Option<Attachment>> {
        let db = self.db.lock().await;
        get_attachment(db.connection(), id)
    }

    pub async fn list_for_report(&self, report_id: &ReportId) -> Result<Vec<Attachment>> {
        let db = self.db.lock().await;
        list_attachments(db.connection(), report_id)
    }

    /// Read the managed copy of an attachment.
    pub async fn read_bytes(&self, attachment: &Attachment) -> Result<Vec<u8>> {
        let path = attachment.local_path.as_ref().ok_or_else(|| {
            Error::Storage(format!("attachment {} has no local copy", attachment.id))
        })?;
        tokio::fs::read(path).await.map_err(|error| {
            Error::Storage(format!("failed to read {}: {error}", path.display()))
        })
    }

    pub async fn mark_uploading(&self, id: &AttachmentId) -> Result<()> {
        self.set_status(id, UploadStatus::Uploading, None).await
    }

    /// Record the server URL of an uploaded attachment.
    pub async fn mark_uploaded(&self, id: &AttachmentId, remote_url: &str) -> Result<()> {
        let db = self.db.lock().await;
        let mut attachment = get_attachment(db.connection(), id)?
            .ok_or_else(|| Error::NotFound(format!("attachment {id}")))?;
        attachment.remote_url = Some(remote_url.to_string());
        attachment.upload_status = UploadStatus::Uploaded;
        attachment.last_error = None;
        attachment.updated_at = now_millis();
        upsert_attachment(db.connection(), &attachment)?;
        drop(db);
        self.changes.notify();
        Ok(())
    }

    pub async fn mark_failed(&self, id: &AttachmentId, reason: &str) -> Result<()> {
        self.set_status(id, UploadStatus::Failed, Some(reason)).await
    }

    /// Put an attachment back to `Pending`, e.g. after an interrupted upload.
    pub async fn mark_pending(&self, id: &AttachmentId) -> Result<()> {
        self.set_status(id, UploadStatus::Pending, None).await
    }

    async fn set_status(
        &self,
        id: &AttachmentId,
        status: UploadStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let rows = set_upload_status(db.connection(), id, status, error, now_millis())?;
        drop(db);
        if rows == 0 {
            return Err(Error::NotFound(format!("attachment {id}")));
        }
        self.changes.notify();
        Ok(())
    }

    /// Whether `purge` would reclaim the report's files now.
    pub async fn is_purgeable(&self, report_id: &ReportId) -> Result<bool> {
        let db = self.db.lock().await;
        let Some(report) = get_report(db.connection(), report_id)? else {
            return Ok(false);
        };
        let attachments = list_attachments(db.connection(), report_id)?;
        Ok(purge_allowed(report.sync_status, report.is_deleted, &attachments))
    }

    /// Delete local copies once the report is `Synced` and every attachment
    /// is `Uploaded`. Returns the number of files removed; zero when the
    /// report is not yet eligible.
    pub async fn purge(&self, report_id: &ReportId) -> Result<usize> {
        let paths = {
            let mut db = self.db.lock().await;
            let tx = db.connection_mut().transaction()?;
            let Some(report) = get_report(&tx, report_id)? else {
                return Ok(0);
            };
            let attachments = list_attachments(&tx, report_id)?;
            if !purge_allowed(report.sync_status, report.is_deleted, &attachments) {
                tracing::debug!(report = %report_id, "Report not eligible for purge");
                return Ok(0);
            }

            let now = now_millis();
            let mut paths = Vec::new();
            for mut attachment in attachments {
                if let Some(path) = attachment.local_path.take() {
                    attachment.updated_at = now;
                    upsert_attachment(&tx, &attachment)?;
                    paths.push(path);
                }
            }
            tx.commit()?;
            paths
        };

        let removed = remove_files(&paths).await;
        if removed > 0 {
            tracing::info!(report = %report_id, removed, "Purged uploaded attachments");
        }
        Ok(removed)
    }

    /// Remove attachments whose report no longer exists locally.
    pub async fn discard_orphans(&self) -> Result<usize> {
        let orphans = {
            let db = self.db.lock().await;
            let mut stmt = db.connection().prepare(&format!(
                "SELECT {ATTACHMENT_COLUMNS} FROM attachments a
                 WHERE NOT EXISTS (SELECT 1 FROM reports r WHERE r.id = a.report_id)
                   AND a.upload_status NOT IN ('pending', 'uploading')"
            ))?;
            let orphans = stmt
                .query_map([], parse_attachment)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for orphan in &orphans {
                db.connection().execute(
                    "DELETE FROM attachments WHERE id = ?",
                    rusqlite::params![orphan.id.as_str()],
                )?;
            }
            orphans
        };

        let discarded = orphans.len();
        let paths: Vec<PathBuf> = orphans
            .into_iter()
            .filter_map(|orphan| orphan.local_path)
            .collect();
        remove_files(&paths).await;
        if discarded > 0 {
            tracing::info!(discarded, "Discarded orphaned attachments");
        }
        Ok(discarded)
    }
}

fn purge_allowed(status: SyncStatus, is_deleted: bool, attachments: &[Attachment]) -> bool {
    status == SyncStatus::Synced
        && !is_deleted
        && attachments
            .iter()
            .all(|attachment| attachment.upload_status == UploadStatus::Uploaded)
}

async fn remove_files(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "Failed to remove attachment file");
            }
        }
    }
    removed
}

/// Keep only the final path component and drop control characters.
fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .trim();
    base.chars().filter(|c| !c.is_control()).collect()
}
