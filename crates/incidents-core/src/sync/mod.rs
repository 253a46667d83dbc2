//! Sync engine: drains the queue against the remote service.
//!
//! A drain pass claims batches of dispatchable operations (one per entity),
//! runs them with bounded concurrency, and feeds each result back into the
//! local store and queue:
//!
//! - success acknowledges the operation and updates the report;
//! - transient failures and timeouts are retried with backoff until
//!   `max_attempts`, then abandoned;
//! - permanent failures are abandoned and the entity marked failed;
//! - a rejected session is dropped and the pass ends without counting the
//!   attempt;
//! - version conflicts are merged field by field when the edits are
//!   disjoint, and parked for the user otherwise.

mod backoff;
mod connectivity;
mod merge;
mod worker;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Mutex, Notify};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{
    ErrorKind, IncidentReport, OperationKind, OperationTarget, ReportConflict, Session,
    SyncOperation, UploadStatus,
};
use crate::net::{ApiError, ApiResult, AttachmentUpload, NetworkClient, SessionContext};
use crate::queue::SyncQueue;
use crate::stager::AttachmentStager;
use crate::store::LocalStore;
use crate::util::now_millis;

pub use backoff::RetryPolicy;
pub use connectivity::ConnectivityMonitor;
pub use merge::{three_way, MergeOutcome};
pub use worker::SyncWorker;

/// Cooperative cancellation for a drain pass, checked between operations.
#[derive(Debug, Clone, Default)]
pub struct DrainCancel(Arc<AtomicBool>);

impl DrainCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a drain pass ended before the queue ran dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStop {
    Offline,
    NoSession,
    /// The server rejected the session during the pass
    Unauthorized,
    Cancelled,
    /// Another pass was already running
    Busy,
    /// A local storage error interrupted the pass
    LocalError,
}

/// Counters for one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub dispatched: usize,
    pub acked: usize,
    pub uploaded: usize,
    pub retried: usize,
    pub merged: usize,
    pub conflicted: usize,
    pub abandoned: usize,
    pub purged_files: usize,
    pub stopped: Option<DrainStop>,
}

impl DrainReport {
    fn record(&mut self, outcome: Outcome) {
        if !matches!(outcome, Outcome::Released) {
            self.dispatched += 1;
        }
        match outcome {
            Outcome::Acked | Outcome::Skipped => self.acked += 1,
            Outcome::Uploaded { purged } => {
                self.uploaded += 1;
                self.purged_files += purged;
            }
            Outcome::Retried => self.retried += 1,
            Outcome::Merged => self.merged += 1,
            Outcome::Conflicted => self.conflicted += 1,
            Outcome::Abandoned => self.abandoned += 1,
            Outcome::Unauthorized => self.stopped = Some(DrainStop::Unauthorized),
            Outcome::Released => {}
            Outcome::LocalError => self.stopped = Some(DrainStop::LocalError),
        }
    }
}

/// What happened to one dispatched operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Acked,
    /// Nothing left to send; the operation was dropped
    Skipped,
    Uploaded { purged: usize },
    Retried,
    Merged,
    Conflicted,
    Abandoned,
    Unauthorized,
    /// Returned to the queue untouched
    Released,
    LocalError,
}

struct EngineInner {
    store: LocalStore,
    queue: SyncQueue,
    stager: AttachmentStager,
    client: Arc<dyn NetworkClient>,
    sessions: SessionContext,
    connectivity: ConnectivityMonitor,
    config: SyncConfig,
    policy: RetryPolicy,
    wake: Notify,
    draining: Mutex<()>,
}

/// Drives queued operations to the remote service.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        stager: AttachmentStager,
        client: Arc<dyn NetworkClient>,
        sessions: SessionContext,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                queue: store.queue(),
                store,
                stager,
                client,
                sessions,
                connectivity,
                policy: RetryPolicy::from_config(&config),
                config,
                wake: Notify::new(),
                draining: Mutex::new(()),
            }),
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    pub fn stager(&self) -> &AttachmentStager {
        &self.inner.stager
    }

    pub fn sessions(&self) -> &SessionContext {
        &self.inner.sessions
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn client(&self) -> &Arc<dyn NetworkClient> {
        &self.inner.client
    }

    /// Ask a running [`SyncWorker`] to drain soon.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.inner.wake.notified().await;
    }

    /// Drain until the queue has nothing dispatchable.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.drain_with(&DrainCancel::new()).await
    }

    pub async fn drain_with(&self, cancel: &DrainCancel) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let Ok(_pass) = self.inner.draining.try_lock() else {
            report.stopped = Some(DrainStop::Busy);
            return Ok(report);
        };

        loop {
            if cancel.is_cancelled() {
                report.stopped = Some(DrainStop::Cancelled);
                break;
            }
            if !self.inner.connectivity.is_online() {
                report.stopped = Some(DrainStop::Offline);
                break;
            }
            let Some(session) = self.inner.sessions.current().await else {
                report.stopped = Some(DrainStop::NoSession);
                break;
            };

            let batch = self.inner.queue.next_batch(self.inner.config.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            tracing::debug!(operations = batch.len(), "Dispatching sync batch");

            let outcomes: Vec<Outcome> = futures::stream::iter(batch)
                .map(|op| self.process(op, &session, cancel))
                .buffer_unordered(self.inner.config.max_concurrency)
                .collect()
                .await;
            for outcome in outcomes {
                report.record(outcome);
            }
            if report.stopped.is_some() {
                break;
            }
        }

        if report.dispatched > 0 || report.stopped.is_some() {
            tracing::info!(
                dispatched = report.dispatched,
                acked = report.acked,
                uploaded = report.uploaded,
                retried = report.retried,
                merged = report.merged,
                conflicted = report.conflicted,
                abandoned = report.abandoned,
                stopped = ?report.stopped,
                "Sync pass finished"
            );
        }
        Ok(report)
    }

    async fn process(&self, op: SyncOperation, session: &Session, cancel: &DrainCancel) -> Outcome {
        if cancel.is_cancelled() {
            return self.release(&op).await;
        }
        let result = match op.kind {
            OperationKind::Create => self.dispatch_create(&op, session).await,
            OperationKind::Update => self.dispatch_update(&op, session).await,
            OperationKind::Delete => self.dispatch_delete(&op, session).await,
            OperationKind::Upload => self.dispatch_upload(&op, session).await,
        };
        match result {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(op = %op.id, kind = %op.kind, %error, "Failed to record sync result");
                self.release(&op).await;
                Outcome::LocalError
            }
        }
    }

    async fn release(&self, op: &SyncOperation) -> Outcome {
        if let Err(error) = self.inner.queue.release(&op.id).await {
            tracing::error!(op = %op.id, %error, "Failed to release operation");
        }
        Outcome::Released
    }

    /// Run a network call under the request timeout.
    async fn call<T>(&self, request: impl Future<Output = ApiResult<T>>) -> ApiResult<T> {
        tokio::time::timeout(self.inner.config.request_timeout, request)
            .await
            .unwrap_or(Err(ApiError::Timeout))
    }

    /// Load the operation's report, dropping the operation if it is gone.
    async fn report_for(&self, op: &SyncOperation) -> Result<Option<IncidentReport>> {
        let report = self.inner.store.get_report(&op.report_id()).await?;
        if report.is_none() {
            tracing::debug!(op = %op.id, "Report no longer exists; dropping operation");
            self.inner.queue.ack(&op.id).await?;
        }
        Ok(report)
    }

    async fn dispatch_create(&self, op: &SyncOperation, session: &Session) -> Result<Outcome> {
        let Some(report) = self.report_for(op).await? else {
            return Ok(Outcome::Skipped);
        };
        let fields = op.payload.as_ref().unwrap_or(&report.fields);
        let client = &self.inner.client;
        match self
            .call(client.create_report(session, fields, &report.idempotency_token))
            .await
        {
            Ok(remote) => {
                tracing::info!(report = %report.id, remote = %remote.remote_id, "Report created on server");
                let acked = self.inner.store.apply_remote_result(op, &remote).await?;
                self.purge_if_synced(acked.as_ref()).await?;
                Ok(Outcome::Acked)
            }
            Err(error) => self.handle_failure(op, error).await,
        }
    }

    async fn dispatch_update(&self, op: &SyncOperation, session: &Session) -> Result<Outcome> {
        let Some(report) = self.report_for(op).await? else {
            return Ok(Outcome::Skipped);
        };
        let Some(remote_id) = report.remote_id.clone() else {
            // an edit only reaches the head once its create was acked or dropped
            return Err(Error::Conflict(format!(
                "update for report {} has no remote record",
                report.id
            )));
        };
        let expected = report.remote_revision.clone().unwrap_or_default();
        let fields = op.payload.as_ref().unwrap_or(&report.fields);
        let client = &self.inner.client;
        match self
            .call(client.update_report(session, &remote_id, fields, &expected))
            .await
        {
            Ok(remote) => {
                let acked = self.inner.store.apply_remote_result(op, &remote).await?;
                self.purge_if_synced(acked.as_ref()).await?;
                Ok(Outcome::Acked)
            }
            Err(ApiError::Conflict(message)) => {
                tracing::debug!(report = %report.id, %message, "Update conflicted; fetching server copy");
                self.reconcile(op, &report, &remote_id, session).await
            }
            Err(error) => self.handle_failure(op, error).await,
        }
    }

    /// Merge a conflicting update with the server copy, or park it for the user.
    async fn reconcile(
        &self,
        op: &SyncOperation,
        report: &IncidentReport,
        remote_id: &str,
        session: &Session,
    ) -> Result<Outcome> {
        let client = &self.inner.client;
        let remote = match self.call(client.fetch_report(session, remote_id)).await {
            Ok(remote) => remote,
            Err(error) => return self.handle_failure(op, error).await,
        };
        let local = op.payload.as_ref().unwrap_or(&report.fields);

        match three_way(report.synced_fields.as_ref(), local, &remote.fields) {
            MergeOutcome::Conflicting(fields) => {
                tracing::warn!(
                    report = %report.id,
                    fields = ?fields,
                    "Concurrent edits need a manual resolution"
                );
                let message = format!("conflict on {}", join_fields(&fields));
                self.inner
                    .store
                    .mark_conflict(
                        &report.id,
                        ReportConflict {
                            local: report.fields.clone(),
                            remote,
                            fields,
                            detected_at: now_millis(),
                        },
                    )
                    .await?;
                self.inner
                    .queue
                    .postpone(&op.id, Duration::ZERO, ErrorKind::Conflict, &message)
                    .await?;
                Ok(Outcome::Conflicted)
            }
            MergeOutcome::Merged {
                fields,
                remote_changes,
            } => {
                let rebased = self
                    .inner
                    .store
                    .rebase_onto_remote(op, &remote, &fields, &remote_changes)
                    .await?;
                if fields == remote.fields {
                    let acked = self.inner.store.apply_remote_result(&rebased, &remote).await?;
                    self.purge_if_synced(acked.as_ref()).await?;
                    return Ok(Outcome::Merged);
                }
                match self
                    .call(client.update_report(session, remote_id, &fields, &remote.revision))
                    .await
                {
                    Ok(updated) => {
                        tracing::info!(report = %report.id, "Merged concurrent edits");
                        let acked = self.inner.store.apply_remote_result(&rebased, &updated).await?;
                        self.purge_if_synced(acked.as_ref()).await?;
                        Ok(Outcome::Merged)
                    }
                    // the server moved again; try the whole cycle later
                    Err(ApiError::Conflict(message)) => {
                        self.retry_later(&rebased, ErrorKind::Conflict, &message).await
                    }
                    Err(error) => self.handle_failure(&rebased, error).await,
                }
            }
        }
    }

    async fn dispatch_delete(&self, op: &SyncOperation, session: &Session) -> Result<Outcome> {
        let Some(report) = self.report_for(op).await? else {
            return Ok(Outcome::Skipped);
        };
        let client = &self.inner.client;

        let remote_id = match report.remote_id.clone() {
            Some(remote_id) => Some(remote_id),
            // an earlier create attempt may have landed without us hearing back
            None => match self
                .call(client.find_by_token(session, &report.idempotency_token))
                .await
            {
                Ok(found) => found.map(|remote| remote.remote_id),
                Err(error) => return self.handle_failure(op, error).await,
            },
        };

        if let Some(remote_id) = remote_id {
            match self.call(client.delete_report(session, &remote_id)).await {
                Ok(()) | Err(ApiError::NotFound(_)) => {}
                Err(error) => return self.handle_failure(op, error).await,
            }
        }
        self.inner.store.apply_delete_ack(op).await?;
        tracing::info!(report = %report.id, "Report deleted on server");
        Ok(Outcome::Acked)
    }

    async fn dispatch_upload(&self, op: &SyncOperation, session: &Session) -> Result<Outcome> {
        let OperationTarget::Attachment { attachment, report } = op.target else {
            return Err(Error::InvalidInput(format!(
                "operation {} has no attachment target",
                op.id
            )));
        };
        let stager = &self.inner.stager;

        let Some(staged) = stager
            .get(&attachment)
            .await?
            .filter(|staged| staged.upload_status.holds_unsynced_data())
        else {
            self.inner.queue.ack(&op.id).await?;
            return Ok(Outcome::Skipped);
        };
        let Some(parent) = self
            .inner
            .store
            .get_report(&report)
            .await?
            .filter(|parent| !parent.is_deleted)
        else {
            self.inner.queue.ack(&op.id).await?;
            return Ok(Outcome::Skipped);
        };
        let Some(remote_id) = parent.remote_id.clone() else {
            return Ok(self.release(op).await);
        };

        let bytes = match stager.read_bytes(&staged).await {
            Ok(bytes) => bytes,
            Err(error) => return self.abandon(op, &error.to_string()).await,
        };
        stager.mark_uploading(&attachment).await?;

        let upload = AttachmentUpload {
            file_name: staged.file_name.clone(),
            mime_type: staged.mime_type.clone(),
            bytes,
        };
        let client = &self.inner.client;
        match self
            .call(client.upload_attachment(session, &remote_id, upload))
            .await
        {
            Ok(uploaded) => {
                tracing::info!(attachment = %attachment, url = %uploaded.url, "Attachment uploaded");
                let parent = self.inner.store.apply_upload_ack(op, &uploaded).await?;
                let purged = self.purge_if_synced(parent.as_ref()).await?;
                Ok(Outcome::Uploaded { purged })
            }
            Err(error) => self.handle_failure(op, error).await,
        }
    }

    async fn purge_if_synced(&self, report: Option<&IncidentReport>) -> Result<usize> {
        match report {
            Some(report) if self.inner.config.purge_uploaded => {
                self.inner.stager.purge(&report.id).await
            }
            _ => Ok(0),
        }
    }

    async fn handle_failure(&self, op: &SyncOperation, error: ApiError) -> Result<Outcome> {
        match error {
            ApiError::Unauthorized(message) => {
                tracing::warn!(op = %op.id, %message, "Session rejected; pausing sync");
                self.inner.sessions.invalidate().await;
                self.inner
                    .queue
                    .postpone(&op.id, Duration::ZERO, ErrorKind::Unauthorized, &message)
                    .await?;
                self.reset_upload(op).await?;
                Ok(Outcome::Unauthorized)
            }
            error if error.is_retryable() => {
                self.retry_later(op, error.kind(), &error.to_string()).await
            }
            error => self.abandon(op, &error.to_string()).await,
        }
    }

    async fn retry_later(
        &self,
        op: &SyncOperation,
        kind: ErrorKind,
        message: &str,
    ) -> Result<Outcome> {
        let attempt = op.attempts.saturating_add(1);
        if attempt >= self.inner.config.max_attempts {
            return self
                .abandon(op, &format!("gave up after {attempt} attempts: {message}"))
                .await;
        }
        let delay = self.inner.policy.delay(attempt);
        self.inner
            .queue
            .reschedule(&op.id, delay, kind, message)
            .await?;
        self.reset_upload(op).await?;
        tracing::warn!(
            op = %op.id,
            kind = %op.kind,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            %message,
            "Sync operation failed; will retry"
        );
        Ok(Outcome::Retried)
    }

    async fn abandon(&self, op: &SyncOperation, message: &str) -> Result<Outcome> {
        match op.target {
            OperationTarget::Report(_) => self.inner.store.fail_operation(op, message).await?,
            OperationTarget::Attachment { attachment, .. } => {
                self.inner.queue.ack(&op.id).await?;
                self.inner.stager.mark_failed(&attachment, message).await?;
            }
        }
        tracing::error!(op = %op.id, kind = %op.kind, %message, "Sync operation abandoned");
        Ok(Outcome::Abandoned)
    }

    /// Put an interrupted upload back to `Pending`.
    async fn reset_upload(&self, op: &SyncOperation) -> Result<()> {
        if let OperationTarget::Attachment { attachment, .. } = op.target {
            if let Some(staged) = self.inner.stager.get(&attachment).await? {
                if staged.upload_status == UploadStatus::Uploading {
                    self.inner.stager.mark_pending(&attachment).await?;
                }
            }
        }
        Ok(())
    }
}

fn join_fields(fields: &[crate::models::ReportField]) -> String {
    fields
        .iter()
        .map(|field| field.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{ConflictChoice, ReportDraft, ReportField, ReportPatch, SyncStatus};
    use crate::net::{Fault, MemoryBackend, RecordedCall};
    use pretty_assertions::assert_eq;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        engine: SyncEngine,
        backend: MemoryBackend,
        _dir: TempDir,
    }

    fn session() -> Session {
        Session {
            token: "tok-responder".to_string(),
            user_id: "admin0000000001".to_string(),
            full_name: "Ana Cruz".to_string(),
            responder_id: Some("resp00000000001".to_string()),
        }
    }

    /// No backoff or jitter so retries run within the same pass.
    fn fast_config() -> SyncConfig {
        SyncConfig::default()
            .with_backoff(Duration::ZERO, Duration::ZERO)
            .with_jitter(Duration::ZERO)
            .without_auto_sync()
    }

    async fn harness(config: SyncConfig) -> Harness {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(Database::open_in_memory().unwrap().into_shared());
        let stager = store.stager(dir.path().join("attachments"));
        let backend = MemoryBackend::new();
        let sessions = SessionContext::in_memory();
        sessions.set(session()).await.unwrap();
        let engine = SyncEngine::new(
            store,
            stager,
            Arc::new(backend.clone()),
            sessions,
            ConnectivityMonitor::new(true),
            config,
        )
        .unwrap();
        Harness {
            engine,
            backend,
            _dir: dir,
        }
    }

    async fn create(h: &Harness, title: &str) -> IncidentReport {
        h.engine
            .store()
            .create_report(ReportDraft::new(title))
            .await
            .unwrap()
    }

    async fn reload(h: &Harness, id: &crate::models::ReportId) -> IncidentReport {
        h.engine.store().get_report(id).await.unwrap().unwrap()
    }

    fn retitle(title: &str) -> ReportPatch {
        ReportPatch {
            title: Some(title.to_string()),
            ..ReportPatch::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_report_with_photo_syncs_when_online() {
        let h = harness(fast_config()).await;
        h.engine.connectivity().set_online(false);

        let report = create(&h, "Flooded underpass").await;
        let photo = h
            .engine
            .stager()
            .stage(report.id, "flood.jpg", None, b"jpeg bytes")
            .await
            .unwrap();
        assert_eq!(h.engine.queue().pending_count().await.unwrap(), 1);

        let offline = h.engine.drain().await.unwrap();
        assert_eq!(offline.stopped, Some(DrainStop::Offline));
        assert_eq!(h.backend.call_count().await, 0);

        h.engine.connectivity().set_online(true);
        let pass = h.engine.drain().await.unwrap();
        assert_eq!(pass.stopped, None);
        assert_eq!(pass.acked, 1);
        assert_eq!(pass.uploaded, 1);
        assert_eq!(pass.purged_files, 1);

        let synced = reload(&h, &report.id).await;
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        let remote_id = synced.remote_id.clone().unwrap();
        assert_eq!(remote_id, report.idempotency_token.as_str());

        let uploaded = h.engine.stager().get(&photo.id).await.unwrap().unwrap();
        assert_eq!(uploaded.upload_status, UploadStatus::Uploaded);
        assert_eq!(uploaded.local_path, None);
        assert!(!photo.local_path.unwrap().exists());

        let record = h.backend.record(&remote_id).await.unwrap();
        assert_eq!(record.files, vec![uploaded.remote_url.unwrap()]);
        assert_eq!(synced.remote_revision, Some(record.revision));
        assert_eq!(h.engine.queue().pending_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_purge_can_be_disabled() {
        let h = harness(fast_config().with_purge_uploaded(false)).await;
        let report = create(&h, "Broken hydrant").await;
        let photo = h
            .engine
            .stager()
            .stage(report.id, "hydrant.png", None, b"png")
            .await
            .unwrap();

        h.engine.drain().await.unwrap();

        let uploaded = h.engine.stager().get(&photo.id).await.unwrap().unwrap();
        assert_eq!(uploaded.upload_status, UploadStatus::Uploaded);
        assert!(uploaded.local_path.unwrap().exists());
        assert!(h.engine.stager().is_purgeable(&report.id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_then_delete_offline_never_reaches_server() {
        let h = harness(fast_config()).await;
        let report = create(&h, "Typo").await;
        h.engine.store().delete_report(&report.id).await.unwrap();

        let pass = h.engine.drain().await.unwrap();

        assert_eq!(pass.dispatched, 0);
        assert_eq!(h.backend.call_count().await, 0);
        assert!(h.engine.store().get_report(&report.id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_edits_before_first_sync_are_sent_as_one_create() {
        let h = harness(fast_config()).await;
        let first = create(&h, "Downed line").await;
        h.engine
            .store()
            .update_report(&first.id, retitle("Downed power line"))
            .await
            .unwrap();
        let second = create(&h, "Gas smell").await;

        h.engine.drain().await.unwrap();

        let calls = h.backend.calls().await;
        assert_eq!(calls.len(), 2);
        assert!(calls
            .iter()
            .all(|call| matches!(call, RecordedCall::Create { .. })));
        let record = h
            .backend
            .record(first.idempotency_token.as_str())
            .await
            .unwrap();
        assert_eq!(record.fields.title, "Downed power line");
        assert_eq!(reload(&h, &second.id).await.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lost_create_response_does_not_duplicate() {
        let h = harness(fast_config()).await;
        let report = create(&h, "Stray dog").await;
        h.backend
            .inject(Fault::LoseResponse(ApiError::Timeout))
            .await;

        let pass = h.engine.drain().await.unwrap();

        assert_eq!(pass.retried, 1);
        assert_eq!(pass.acked, 1);
        assert_eq!(h.backend.records().await.len(), 1);
        let synced = reload(&h, &report.id).await;
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        assert_eq!(synced.remote_id.as_deref(), Some(report.idempotency_token.as_str()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transient_failures_give_up_after_max_attempts() {
        let h = harness(fast_config().with_max_attempts(3)).await;
        let report = create(&h, "Pothole").await;
        for _ in 0..3 {
            h.backend
                .fail_next(ApiError::Transient("503 Service Unavailable".to_string()))
                .await;
        }

        let pass = h.engine.drain().await.unwrap();

        assert_eq!(pass.retried, 2);
        assert_eq!(pass.abandoned, 1);
        assert_eq!(h.backend.call_count().await, 3);
        let failed = reload(&h, &report.id).await;
        assert_eq!(failed.sync_status, SyncStatus::Failed);
        assert!(failed.last_error.unwrap().contains("gave up after 3 attempts"));
        assert_eq!(h.engine.queue().pending_count().await.unwrap(), 0);

        h.engine.store().retry(&report.id).await.unwrap();
        h.engine.drain().await.unwrap();
        assert_eq!(reload(&h, &report.id).await.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_permanent_failure_is_not_retried() {
        let h = harness(fast_config()).await;
        let report = create(&h, "Graffiti").await;
        h.backend
            .fail_next(ApiError::Permanent("validation failed (400)".to_string()))
            .await;

        let pass = h.engine.drain().await.unwrap();

        assert_eq!(pass.abandoned, 1);
        assert_eq!(h.backend.call_count().await, 1);
        let failed = reload(&h, &report.id).await;
        assert_eq!(failed.sync_status, SyncStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("Request rejected: validation failed (400)"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejected_create_drops_edits_queued_behind_it() {
        let h = harness(fast_config()).await;
        let report = create(&h, "Gas smell").await;
        let claimed = h.engine.queue().next_batch(1).await.unwrap().remove(0);
        h.engine
            .store()
            .update_report(&report.id, retitle("Gas smell near school"))
            .await
            .unwrap();
        h.engine.queue().release(&claimed.id).await.unwrap();
        assert_eq!(h.engine.queue().pending_count().await.unwrap(), 2);
        h.backend
            .fail_next(ApiError::Permanent("validation failed (400)".to_string()))
            .await;

        let pass = h.engine.drain().await.unwrap();

        assert_eq!(pass.dispatched, 1);
        assert_eq!(pass.retried, 0);
        assert_eq!(pass.abandoned, 1);
        assert_eq!(h.backend.call_count().await, 1);
        assert_eq!(h.engine.queue().pending_count().await.unwrap(), 0);
        let failed = reload(&h, &report.id).await;
        assert_eq!(failed.sync_status, SyncStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("Request rejected: validation failed (400)"));

        let idle = h.engine.drain().await.unwrap();
        assert_eq!(idle.dispatched, 0);

        h.engine.store().retry(&report.id).await.unwrap();
        h.engine.drain().await.unwrap();
        let synced = reload(&h, &report.id).await;
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        let record = h.backend.record(&synced.remote_id.unwrap()).await.unwrap();
        assert_eq!(record.fields.title, "Gas smell near school");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upload_and_edit_keep_server_revision_current() {
        let h = harness(fast_config()).await;
        let report = create(&h, "Collapsed wall").await;
        h.engine.drain().await.unwrap();

        h.engine
            .stager()
            .stage(report.id, "wall.jpg", None, b"jpeg")
            .await
            .unwrap();
        h.engine
            .store()
            .update_report(&report.id, retitle("Collapsed wall, road blocked"))
            .await
            .unwrap();

        let pass = h.engine.drain().await.unwrap();

        assert_eq!(pass.uploaded, 1);
        assert_eq!(pass.acked, 1);
        assert_eq!(pass.merged, 0);
        assert_eq!(pass.conflicted, 0);
        let synced = reload(&h, &report.id).await;
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        let record = h.backend.record(synced.remote_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(synced.remote_revision, Some(record.revision));
        assert_eq!(record.files.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_is_delayed_by_backoff() {
        let config = SyncConfig::default()
            .with_backoff(Duration::from_secs(60), Duration::from_secs(60))
            .with_jitter(Duration::ZERO)
            .without_auto_sync();
        let h = harness(config).await;
        create(&h, "Fallen tree").await;
        h.backend
            .fail_next(ApiError::Transient("connection reset".to_string()))
            .await;

        let pass = h.engine.drain().await.unwrap();

        assert_eq!(pass.retried, 1);
        assert_eq!(h.backend.call_count().await, 1);
        let op = h.engine.queue().list().await.unwrap().remove(0);
        assert_eq!(op.attempts, 1);
        assert_eq!(op.last_error_kind, Some(ErrorKind::Transient));
        assert!(op.next_eligible_at >= now_millis() + 50_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_request_times_out_and_is_retried() {
        let config = fast_config()
            .with_backoff(Duration::from_secs(60), Duration::from_secs(60))
            .with_request_timeout(Duration::from_millis(50));
        let h = harness(config).await;
        create(&h, "Noise complaint").await;
        h.backend
            .inject(Fault::Delay(Duration::from_millis(500)))
            .await;

        let pass = h.engine.drain().await.unwrap();

        assert_eq!(pass.retried, 1);
        let op = h.engine.queue().list().await.unwrap().remove(0);
        assert_eq!(op.last_error_kind, Some(ErrorKind::Timeout));
        assert_eq!(op.attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejected_session_pauses_without_counting_attempt() {
        let h = harness(fast_config()).await;
        let report = create(&h, "Abandoned car").await;
        h.backend.revoke_token("tok-responder").await;

        let pass = h.engine.drain().await.unwrap();

        assert_eq!(pass.stopped, Some(DrainStop::Unauthorized));
        assert!(h.engine.sessions().current().await.is_none());
        let op = h.engine.queue().list().await.unwrap().remove(0);
        assert_eq!(op.attempts, 0);
        assert_eq!(op.last_error_kind, Some(ErrorKind::Unauthorized));
        assert_eq!(reload(&h, &report.id).await.sync_status, SyncStatus::PendingCreate);

        let idle = h.engine.drain().await.unwrap();
        assert_eq!(idle.stopped, Some(DrainStop::NoSession));
        assert_eq!(h.backend.call_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disjoint_remote_edit_is_merged() {
        let h = harness(fast_config()).await;
        let report = create(&h, "Blocked drain").await;
        h.engine.drain().await.unwrap();
        let remote_id = reload(&h, &report.id).await.remote_id.unwrap();

        h.backend
            .edit_remotely(&remote_id, |fields| {
                fields.status = crate::models::IncidentStatus::Resolved;
            })
            .await
            .unwrap();
        h.engine
            .store()
            .update_report(
                &report.id,
                ReportPatch {
                    description: Some("Leaves clog the grate".to_string()),
                    ..ReportPatch::default()
                },
            )
            .await
            .unwrap();

        let pass = h.engine.drain().await.unwrap();

        assert_eq!(pass.merged, 1);
        let merged = reload(&h, &report.id).await;
        assert_eq!(merged.sync_status, SyncStatus::Synced);
        assert_eq!(merged.fields.description, "Leaves clog the grate");
        assert_eq!(merged.fields.status, crate::models::IncidentStatus::Resolved);

        let record = h.backend.record(&remote_id).await.unwrap();
        assert_eq!(record.fields, merged.fields);
        assert_eq!(merged.remote_revision, Some(record.revision));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_overlapping_edit_waits_for_user() {
        let h = harness(fast_config()).await;
        let report = create(&h, "Loose manhole").await;
        h.engine.drain().await.unwrap();
        let remote_id = reload(&h, &report.id).await.remote_id.unwrap();

        h.backend
            .edit_remotely(&remote_id, |fields| fields.title = "Open manhole".to_string())
            .await
            .unwrap();
        h.engine
            .store()
            .update_report(&report.id, retitle("Missing manhole cover"))
            .await
            .unwrap();

        let pass = h.engine.drain().await.unwrap();
        assert_eq!(pass.conflicted, 1);

        let parked = reload(&h, &report.id).await;
        assert_eq!(parked.sync_status, SyncStatus::Conflict);
        let conflict = parked.conflict.unwrap();
        assert_eq!(conflict.fields, vec![ReportField::Title]);
        assert_eq!(conflict.remote.fields.title, "Open manhole");

        let held = h.engine.drain().await.unwrap();
        assert_eq!(held.dispatched, 0);
        assert_eq!(h.engine.queue().pending_count().await.unwrap(), 1);

        h.engine
            .store()
            .resolve_conflict(&report.id, ConflictChoice::KeepLocal)
            .await
            .unwrap();
        h.engine.drain().await.unwrap();

        let resolved = reload(&h, &report.id).await;
        assert_eq!(resolved.sync_status, SyncStatus::Synced);
        assert_eq!(
            h.backend.record(&remote_id).await.unwrap().fields.title,
            "Missing manhole cover"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_of_synced_report_removes_record() {
        let h = harness(fast_config()).await;
        let report = create(&h, "Duplicate entry").await;
        h.engine.drain().await.unwrap();

        h.engine.store().delete_report(&report.id).await.unwrap();
        assert_eq!(
            reload(&h, &report.id).await.sync_status,
            SyncStatus::PendingDelete
        );
        h.engine.drain().await.unwrap();

        assert!(h.backend.records().await.is_empty());
        assert!(h.engine.store().get_report(&report.id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_of_record_already_gone_succeeds() {
        let h = harness(fast_config()).await;
        let report = create(&h, "Handled by phone").await;
        h.engine.drain().await.unwrap();
        let remote_id = reload(&h, &report.id).await.remote_id.unwrap();

        assert!(h.backend.delete_remotely(&remote_id).await);
        h.engine.store().delete_report(&report.id).await.unwrap();
        let pass = h.engine.drain().await.unwrap();

        assert_eq!(pass.acked, 1);
        assert_eq!(pass.abandoned, 0);
        assert!(h.engine.store().get_report(&report.id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_after_unconfirmed_create_finds_record_by_token() {
        let config =
            fast_config().with_backoff(Duration::from_secs(60), Duration::from_secs(60));
        let h = harness(config).await;
        let report = create(&h, "Sent twice").await;
        h.backend
            .inject(Fault::LoseResponse(ApiError::Transient("reset".to_string())))
            .await;
        h.engine.drain().await.unwrap();
        assert_eq!(h.backend.records().await.len(), 1);

        h.engine.store().delete_report(&report.id).await.unwrap();
        h.engine.drain().await.unwrap();

        assert!(h.backend.records().await.is_empty());
        assert!(h
            .backend
            .calls()
            .await
            .iter()
            .any(|call| matches!(call, RecordedCall::FindByToken { .. })));
        assert!(h.engine.store().get_report(&report.id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_pass_makes_no_calls() {
        let h = harness(fast_config()).await;
        create(&h, "Never sent").await;
        let cancel = DrainCancel::new();
        cancel.cancel();

        let pass = h.engine.drain_with(&cancel).await.unwrap();

        assert_eq!(pass.stopped, Some(DrainStop::Cancelled));
        assert_eq!(h.backend.call_count().await, 0);
        assert_eq!(h.engine.queue().pending_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_config_is_rejected() {
        let store = LocalStore::new(Database::open_in_memory().unwrap().into_shared());
        let stager = store.stager(std::env::temp_dir());
        let result = SyncEngine::new(
            store,
            stager,
            Arc::new(MemoryBackend::new()),
            SessionContext::in_memory(),
            ConnectivityMonitor::default(),
            SyncConfig::default().with_max_attempts(0),
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
