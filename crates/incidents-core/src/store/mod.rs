//! Transactional local store for incident reports.
//!
//! Every mutation runs in one `SQLite` transaction that updates the report
//! row and enqueues (or coalesces) the matching sync operation, so the report
//! and the queue can never disagree after a crash. Observers are woken through
//! a [`ChangeFeed`] after each commit.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::Stream;
use rusqlite::Connection;
use tokio::sync::watch;

use crate::db::rows::{
    delete_report, get_report, list_attachments, parse_report, set_upload_status, upsert_report,
    REPORT_COLUMNS,
};
use crate::db::SharedDatabase;
use crate::error::{Error, Result};
use crate::models::{
    ConflictChoice, IncidentReport, OperationTarget, RemoteReport, ReportConflict,
    ReportDraft, ReportField, ReportFields, ReportId, ReportPatch, SyncOperation, SyncStatus,
    UploadStatus, UploadedAttachment,
};
use crate::queue::{
    ack_in, enqueue_in, get_in, has_pending_for_report, queued_edits_for_report,
    remove_for_report, remove_uploads_for_report, replace_payload_in, reset_backoff_in,
    EnqueueOutcome, NewOperation, SyncQueue,
};
use crate::stager::AttachmentStager;
use crate::util::now_millis;

const DISCARDED_REASON: &str = "report discarded";

/// Wakes observers after committed changes.
#[derive(Clone)]
pub struct ChangeFeed(Arc<watch::Sender<u64>>);

impl Default for ChangeFeed {
    fn default() -> Self {
        let (sender, _) = watch::channel(0);
        Self(Arc::new(sender))
    }
}

impl ChangeFeed {
    pub fn notify(&self) {
        self.0.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.0.subscribe()
    }
}

/// A report together with its attachment progress, as shown in list views.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSnapshot {
    pub report: IncidentReport,
    /// Attachments whose bytes have not reached the server yet
    pub pending_attachments: usize,
    pub failed_attachments: usize,
}

/// Owner of report state. All report mutations go through here.
#[derive(Clone)]
pub struct LocalStore {
    db: SharedDatabase,
    changes: ChangeFeed,
}

impl LocalStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self {
            db,
            changes: ChangeFeed::default(),
        }
    }

    pub const fn database(&self) -> &SharedDatabase {
        &self.db
    }

    /// A queue handle over the same database.
    pub fn queue(&self) -> SyncQueue {
        SyncQueue::new(self.db.clone())
    }

    /// An attachment stager over the same database whose changes reach this
    /// store's observers.
    pub fn stager(&self, root: impl Into<PathBuf>) -> AttachmentStager {
        AttachmentStager::with_changes(self.db.clone(), root, self.changes.clone())
    }

    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    async fn transact<T>(&self, apply: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let value = apply(&tx)?;
        tx.commit()?;
        drop(db);
        self.changes.notify();
        Ok(value)
    }

    /// Save a new report and queue its creation.
    ///
    /// The report is written as `Draft` and moved to `PendingCreate` in the
    /// same transaction that enqueues the Create operation.
    pub async fn create_report(&self, draft: ReportDraft) -> Result<IncidentReport> {
        let now = now_millis();
        let fields = draft.into_fields(now)?;
        let mut report = IncidentReport::new(fields, Vec::new());

        let report = self
            .transact(move |conn| {
                upsert_report(conn, &report)?;
                enqueue_in(
                    conn,
                    NewOperation::create(report.id, report.fields.clone(), report.revision),
                    now,
                )?;
                report.sync_status = SyncStatus::PendingCreate;
                upsert_report(conn, &report)?;
                Ok(report)
            })
            .await?;

        tracing::info!(report = %report.id, "Created report");
        Ok(report)
    }

    /// Apply a local edit and queue it for sync.
    pub async fn update_report(&self, id: &ReportId, patch: ReportPatch) -> Result<IncidentReport> {
        let id = *id;
        let report = self
            .transact(move |conn| {
                let mut report = live_report(conn, &id)?;
                if report.sync_status == SyncStatus::Conflict {
                    return Err(Error::Conflict(format!(
                        "report {id} has an unresolved conflict"
                    )));
                }

                let mut fields = report.fields.clone();
                patch.apply(&mut fields)?;
                if fields == report.fields {
                    return Ok(report);
                }

                let now = now_millis();
                report.fields = fields;
                report.revision += 1;
                report.updated_at = now;
                report.last_error = None;

                let op = if report.remote_id.is_none() && report.sync_status == SyncStatus::Failed
                {
                    NewOperation::create(report.id, report.fields.clone(), report.revision)
                } else {
                    NewOperation::update(report.id, report.fields.clone(), report.revision)
                };
                enqueue_in(conn, op, now)?;
                report.sync_status = pending_status(&report);
                upsert_report(conn, &report)?;
                Ok(report)
            })
            .await?;

        tracing::info!(report = %report.id, revision = report.revision, "Updated report");
        Ok(report)
    }

    /// Delete a report locally and queue the remote delete.
    ///
    /// A report whose create never left the device is removed outright.
    pub async fn delete_report(&self, id: &ReportId) -> Result<()> {
        let id = *id;
        let discarded = self
            .transact(move |conn| {
                let mut report = live_report(conn, &id)?;
                let now = now_millis();

                remove_uploads_for_report(conn, &id)?;
                for attachment in list_attachments(conn, &id)? {
                    if attachment.upload_status == UploadStatus::Pending {
                        set_upload_status(
                            conn,
                            &attachment.id,
                            UploadStatus::Failed,
                            Some(DISCARDED_REASON),
                            now,
                        )?;
                    }
                }

                report.revision += 1;
                let outcome = enqueue_in(conn, NewOperation::delete(id, report.revision), now)?;
                if outcome == EnqueueOutcome::Cancelled {
                    delete_report(conn, &id)?;
                    return Ok(true);
                }

                report.is_deleted = true;
                report.conflict = None;
                report.last_error = None;
                report.updated_at = now;
                report.sync_status = pending_status(&report);
                upsert_report(conn, &report)?;
                Ok(false)
            })
            .await?;

        if discarded {
            tracing::info!(report = %id, "Discarded unsynced report");
        } else {
            tracing::info!(report = %id, "Deleted report");
        }
        Ok(())
    }

    /// Look up a report, including tombstoned ones awaiting remote delete.
    pub async fn get_report(&self, id: &ReportId) -> Result<Option<IncidentReport>> {
        let db = self.db.lock().await;
        get_report(db.connection(), id)
    }

    /// Reports visible to the user, most recently updated first.
    pub async fn list_reports(&self) -> Result<Vec<IncidentReport>> {
        let db = self.db.lock().await;
        list_live_reports(db.connection())
    }

    pub async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<IncidentReport>> {
        Ok(self
            .list_reports()
            .await?
            .into_iter()
            .filter(|report| report.sync_status == status)
            .collect())
    }

    /// Current reports with attachment progress.
    pub async fn snapshot(&self) -> Result<Vec<ReportSnapshot>> {
        let db = self.db.lock().await;
        let conn = db.connection();
        list_live_reports(conn)?
            .into_iter()
            .map(|report| {
                let attachments = list_attachments(conn, &report.id)?;
                let pending_attachments = attachments
                    .iter()
                    .filter(|attachment| attachment.upload_status.holds_unsynced_data())
                    .count();
                let failed_attachments = attachments
                    .iter()
                    .filter(|attachment| attachment.upload_status == UploadStatus::Failed)
                    .count();
                Ok(ReportSnapshot {
                    report,
                    pending_attachments,
                    failed_attachments,
                })
            })
            .collect()
    }

    /// Stream of snapshots: the current state first, then one per committed change.
    ///
    /// Changes that land while the consumer is busy are collapsed into the
    /// next snapshot.
    pub fn observe(&self) -> impl Stream<Item = Result<Vec<ReportSnapshot>>> + Send + 'static {
        let receiver = self.changes.subscribe();
        futures::stream::unfold(
            (self.clone(), receiver, true),
            |(store, mut receiver, first)| async move {
                if !first && receiver.changed().await.is_err() {
                    return None;
                }
                receiver.borrow_and_update();
                let snapshot = store.snapshot().await;
                Some((snapshot, (store, receiver, false)))
            },
        )
    }

    /// Pick a side for a report in `Conflict`.
    pub async fn resolve_conflict(
        &self,
        id: &ReportId,
        choice: ConflictChoice,
    ) -> Result<IncidentReport> {
        let id = *id;
        let report = self
            .transact(move |conn| {
                let mut report = live_report(conn, &id)?;
                let conflict = match (&report.sync_status, report.conflict.take()) {
                    (SyncStatus::Conflict, Some(conflict)) => conflict,
                    _ => {
                        return Err(Error::Conflict(format!(
                            "report {id} has no conflict to resolve"
                        )))
                    }
                };
                let now = now_millis();
                let remote = conflict.remote;

                report.revision += 1;
                report.updated_at = now;
                report.last_error = None;
                report.remote_revision = Some(remote.revision.clone());
                report.synced_fields = Some(remote.fields.clone());

                let keep = match choice {
                    ConflictChoice::KeepRemote => None,
                    ConflictChoice::KeepLocal => Some(conflict.local),
                    ConflictChoice::Merged(fields) => {
                        fields.validate()?;
                        Some(fields)
                    }
                };

                if let Some(fields) = keep {
                    report.fields = fields;
                    let outcome = enqueue_in(
                        conn,
                        NewOperation::update(id, report.fields.clone(), report.revision),
                        now,
                    )?;
                    if let EnqueueOutcome::Appended(op_id) | EnqueueOutcome::Coalesced(op_id) =
                        outcome
                    {
                        reset_backoff_in(conn, &op_id)?;
                    }
                    report.sync_status = SyncStatus::PendingUpdate;
                } else {
                    remove_for_report(conn, &id)?;
                    report.fields = remote.fields;
                    report.sync_status = SyncStatus::Synced;
                    enqueue_pending_uploads(conn, &report, now)?;
                }
                upsert_report(conn, &report)?;
                Ok(report)
            })
            .await?;

        tracing::info!(report = %id, status = %report.sync_status, "Resolved conflict");
        Ok(report)
    }

    /// Re-queue a `Failed` report and any failed attachment uploads.
    pub async fn retry(&self, id: &ReportId) -> Result<IncidentReport> {
        let id = *id;
        self.transact(move |conn| {
            let mut report = get_report(conn, &id)?
                .ok_or_else(|| Error::NotFound(format!("report {id}")))?;
            let now = now_millis();

            let mut retried_attachments = 0;
            for attachment in list_attachments(conn, &id)? {
                if attachment.upload_status == UploadStatus::Failed && !report.is_deleted {
                    set_upload_status(conn, &attachment.id, UploadStatus::Pending, None, now)?;
                    retried_attachments += 1;
                }
            }

            if report.sync_status == SyncStatus::Failed {
                remove_for_report(conn, &id)?;
                let op = if report.is_deleted {
                    NewOperation::delete(id, report.revision)
                } else if report.remote_id.is_none() {
                    NewOperation::create(id, report.fields.clone(), report.revision)
                } else {
                    NewOperation::update(id, report.fields.clone(), report.revision)
                };
                enqueue_in(conn, op, now)?;
                report.sync_status = pending_status(&report);
                report.last_error = None;
                report.updated_at = now;
                upsert_report(conn, &report)?;
            } else if retried_attachments == 0 {
                return Err(Error::Conflict(format!("report {id} has nothing to retry")));
            } else {
                enqueue_pending_uploads(conn, &report, now)?;
            }

            tracing::info!(report = %id, retried_attachments, "Retrying report");
            Ok(report)
        })
        .await
    }

    /// Record a confirmed Create or Update and drop the operation.
    ///
    /// The report only becomes `Synced` when no newer local edit is pending.
    pub(crate) async fn apply_remote_result(
        &self,
        op: &SyncOperation,
        remote: &RemoteReport,
    ) -> Result<Option<IncidentReport>> {
        let op = op.clone();
        let remote = remote.clone();
        self.transact(move |conn| {
            ack_in(conn, &op.id)?;
            let Some(mut report) = get_report(conn, &op.report_id())? else {
                return Ok(None);
            };
            let now = now_millis();

            report.remote_id = Some(remote.remote_id.clone());
            report.remote_revision = Some(remote.revision.clone());
            report.synced_fields = Some(remote.fields.clone());
            report.last_error = None;
            report.updated_at = now;

            let caught_up =
                report.revision == op.base_revision && !has_pending_for_report(conn, &report.id)?;
            report.sync_status = if report.is_deleted {
                SyncStatus::PendingDelete
            } else if caught_up {
                SyncStatus::Synced
            } else {
                SyncStatus::PendingUpdate
            };

            if !report.is_deleted {
                enqueue_pending_uploads(conn, &report, now)?;
            }
            upsert_report(conn, &report)?;
            Ok(Some(report))
        })
        .await
    }

    /// Remove a report whose remote delete was confirmed.
    pub(crate) async fn apply_delete_ack(&self, op: &SyncOperation) -> Result<()> {
        let op = op.clone();
        self.transact(move |conn| {
            ack_in(conn, &op.id)?;
            let id = op.report_id();
            if has_pending_for_report(conn, &id)? {
                return Ok(());
            }
            let now = now_millis();
            for attachment in list_attachments(conn, &id)? {
                if attachment.upload_status == UploadStatus::Pending {
                    set_upload_status(
                        conn,
                        &attachment.id,
                        UploadStatus::Failed,
                        Some(DISCARDED_REASON),
                        now,
                    )?;
                }
            }
            delete_report(conn, &id)
        })
        .await
    }

    /// Record a finished upload and advance the parent's server revision.
    pub(crate) async fn apply_upload_ack(
        &self,
        op: &SyncOperation,
        uploaded: &UploadedAttachment,
    ) -> Result<Option<IncidentReport>> {
        let OperationTarget::Attachment { attachment, report } = op.target else {
            return Err(Error::InvalidInput(format!(
                "operation {} is not an upload",
                op.id
            )));
        };
        let op_id = op.id;
        let uploaded = uploaded.clone();
        self.transact(move |conn| {
            ack_in(conn, &op_id)?;
            let now = now_millis();
            conn.execute(
                "UPDATE attachments
                 SET upload_status = 'uploaded', remote_url = ?, last_error = NULL, updated_at = ?
                 WHERE id = ?",
                rusqlite::params![uploaded.url, now, attachment.as_str()],
            )?;
            let Some(mut parent) = get_report(conn, &report)? else {
                return Ok(None);
            };
            if let Some(revision) = uploaded.report_revision {
                parent.remote_revision = Some(revision);
                parent.updated_at = now;
                upsert_report(conn, &parent)?;
            }
            Ok(Some(parent))
        })
        .await
    }

    /// Park a report in `Conflict` until the user resolves it.
    pub(crate) async fn mark_conflict(&self, id: &ReportId, conflict: ReportConflict) -> Result<()> {
        let id = *id;
        self.transact(move |conn| {
            let mut report = get_report(conn, &id)?
                .ok_or_else(|| Error::NotFound(format!("report {id}")))?;
            report.sync_status = SyncStatus::Conflict;
            report.last_error = Some(format!(
                "conflicting fields: {}",
                conflict
                    .fields
                    .iter()
                    .map(|field| field.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            report.conflict = Some(conflict);
            report.updated_at = now_millis();
            upsert_report(conn, &report)
        })
        .await
    }

    /// Drop an abandoned report operation and mark the report `Failed`.
    ///
    /// Edits queued behind the abandoned operation are dropped with it; the
    /// report waits for [`LocalStore::retry`] or a new local edit, either of
    /// which queues the net operation again.
    pub(crate) async fn fail_operation(&self, op: &SyncOperation, message: &str) -> Result<()> {
        let op = op.clone();
        let message = message.to_string();
        self.transact(move |conn| {
            ack_in(conn, &op.id)?;
            let id = op.report_id();
            let dropped = remove_for_report(conn, &id)?;
            let Some(mut report) = get_report(conn, &id)? else {
                return Ok(());
            };
            report.sync_status = SyncStatus::Failed;
            report.last_error = Some(message);
            report.updated_at = now_millis();
            upsert_report(conn, &report)?;
            if dropped > 0 {
                tracing::debug!(report = %id, dropped, "Dropped edits queued behind failed operation");
            }
            Ok(())
        })
        .await
    }

    /// Adopt non-overlapping server changes into a pending edit.
    ///
    /// `remote_changes` are fields only the server changed. They are copied
    /// into the report and into every queued edit of it, and the in-flight
    /// operation is re-based on the server's revision. Returns the rebased
    /// operation.
    pub(crate) async fn rebase_onto_remote(
        &self,
        op: &SyncOperation,
        remote: &RemoteReport,
        merged: &ReportFields,
        remote_changes: &BTreeSet<ReportField>,
    ) -> Result<SyncOperation> {
        let op = op.clone();
        let remote = remote.clone();
        let merged = merged.clone();
        let remote_changes = remote_changes.clone();
        self.transact(move |conn| {
            let id = op.report_id();
            let mut report = get_report(conn, &id)?
                .ok_or_else(|| Error::NotFound(format!("report {id}")))?;
            let now = now_millis();

            let was_latest = report.revision == op.base_revision;
            for field in &remote_changes {
                report.fields.take_field(&remote.fields, *field);
            }
            report.revision += 1;
            report.remote_revision = Some(remote.revision.clone());
            report.synced_fields = Some(remote.fields.clone());
            report.updated_at = now;
            upsert_report(conn, &report)?;

            for mut queued in queued_edits_for_report(conn, &id)? {
                if queued.id == op.id {
                    continue;
                }
                if let Some(payload) = queued.payload.as_mut() {
                    for field in &remote_changes {
                        payload.take_field(&remote.fields, *field);
                    }
                }
                replace_payload_in(
                    conn,
                    &queued.id,
                    queued.kind,
                    queued.payload.as_ref(),
                    report.revision,
                )?;
            }

            let base_revision = if was_latest {
                report.revision
            } else {
                op.base_revision
            };
            replace_payload_in(conn, &op.id, op.kind, Some(&merged), base_revision)?;
            get_in(conn, &op.id)?
                .ok_or_else(|| Error::NotFound(format!("operation {}", op.id)))
        })
        .await
    }
}

fn live_report(conn: &Connection, id: &ReportId) -> Result<IncidentReport> {
    get_report(conn, id)?
        .filter(|report| !report.is_deleted)
        .ok_or_else(|| Error::NotFound(format!("report {id}")))
}

fn list_live_reports(conn: &Connection) -> Result<Vec<IncidentReport>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REPORT_COLUMNS} FROM reports WHERE is_deleted = 0 ORDER BY updated_at DESC, id"
    ))?;
    let reports = stmt
        .query_map([], parse_report)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(reports)
}

/// Status of a report with local work queued.
///
/// Tombstones without a remote id stay `PendingCreate`: their create may
/// still be acknowledged before the delete is sent.
fn pending_status(report: &IncidentReport) -> SyncStatus {
    match (report.is_deleted, report.remote_id.is_some()) {
        (true, true) => SyncStatus::PendingDelete,
        (_, false) => SyncStatus::PendingCreate,
        (false, true) => SyncStatus::PendingUpdate,
    }
}

/// Queue uploads for the report's `Pending` attachments.
pub(crate) fn enqueue_pending_uploads(
    conn: &Connection,
    report: &IncidentReport,
    now: i64,
) -> Result<usize> {
    let mut queued = 0;
    for attachment in list_attachments(conn, &report.id)? {
        if attachment.upload_status == UploadStatus::Pending {
            enqueue_in(
                conn,
                NewOperation::upload(OperationTarget::Attachment {
                    attachment: attachment.id,
                    report: report.id,
                }),
                now,
            )?;
            queued += 1;
        }
    }
    Ok(queued)
}
