//! In-process stand-in for the remote service.
//!
//! Behaves like the real server (idempotent creates, revision checks,
//! bearer-token auth) and lets tests script failures, simulate edits made
//! by other clients, and inspect every call that reached it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ApiError, ApiResult, AttachmentUpload, NetworkClient};
use crate::models::{
    IdempotencyToken, RemoteReport, ReportFields, Session, UploadedAttachment,
};

/// A scripted outcome for the next call that reaches the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail without applying the request
    Reject(ApiError),
    /// Apply the request, then report a failure as if the response was lost
    LoseResponse(ApiError),
    /// Stall before answering
    Delay(Duration),
}

/// One call observed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Login { identity: String },
    Create { token: String },
    Update { remote_id: String, expected_revision: String },
    Delete { remote_id: String },
    Fetch { remote_id: String },
    FindByToken { token: String },
    Upload { remote_id: String, file_name: String },
}

#[derive(Default)]
struct State {
    reachable: bool,
    records: HashMap<String, RemoteReport>,
    accounts: HashMap<String, (String, Session)>,
    revoked_tokens: HashSet<String>,
    faults: VecDeque<Fault>,
    calls: Vec<RecordedCall>,
    revision: u64,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        format!("rev-{:06}", self.revision)
    }
}

/// In-memory remote service.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                reachable: true,
                ..State::default()
            })),
        }
    }

    /// Unreachable backends fail every call with a transient error.
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.lock().await.reachable = reachable;
    }

    /// Queue a fault for the next call. Faults are consumed in order.
    pub async fn inject(&self, fault: Fault) {
        self.state.lock().await.faults.push_back(fault);
    }

    pub async fn fail_next(&self, error: ApiError) {
        self.inject(Fault::Reject(error)).await;
    }

    pub async fn add_account(&self, identity: &str, password: &str, session: Session) {
        self.state
            .lock()
            .await
            .accounts
            .insert(identity.to_string(), (password.to_string(), session));
    }

    /// Make the server reject a session token from now on.
    pub async fn revoke_token(&self, token: &str) {
        self.state
            .lock()
            .await
            .revoked_tokens
            .insert(token.to_string());
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.state.lock().await.calls.len()
    }

    pub async fn record(&self, remote_id: &str) -> Option<RemoteReport> {
        self.state.lock().await.records.get(remote_id).cloned()
    }

    pub async fn records(&self) -> Vec<RemoteReport> {
        let mut records: Vec<_> = self.state.lock().await.records.values().cloned().collect();
        records.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        records
    }

    /// Simulate another client editing a record. Returns the new revision.
    pub async fn edit_remotely(
        &self,
        remote_id: &str,
        edit: impl FnOnce(&mut ReportFields),
    ) -> Option<String> {
        let mut state = self.state.lock().await;
        let revision = state.next_revision();
        let record = state.records.get_mut(remote_id)?;
        edit(&mut record.fields);
        record.revision.clone_from(&revision);
        Some(revision)
    }

    /// Simulate another client deleting a record.
    pub async fn delete_remotely(&self, remote_id: &str) -> bool {
        self.state.lock().await.records.remove(remote_id).is_some()
    }

    /// Record the call, enforce reachability and auth, and pop the next fault.
    async fn begin(&self, call: RecordedCall, session: Option<&Session>) -> ApiResult<Option<ApiError>> {
        let fault = {
            let mut state = self.state.lock().await;
            state.calls.push(call);
            if !state.reachable {
                return Err(ApiError::Transient("connection refused".to_string()));
            }
            if let Some(session) = session {
                if state.revoked_tokens.contains(&session.token) {
                    return Err(ApiError::Unauthorized("token expired".to_string()));
                }
            }
            state.faults.pop_front()
        };

        match fault {
            None => Ok(None),
            Some(Fault::Reject(error)) => Err(error),
            Some(Fault::LoseResponse(error)) => Ok(Some(error)),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(None)
            }
        }
    }
}

fn finish<T>(value: T, lost: Option<ApiError>) -> ApiResult<T> {
    lost.map_or(Ok(value), Err)
}

#[async_trait]
impl NetworkClient for MemoryBackend {
    async fn login(&self, identity: &str, password: &str) -> ApiResult<Session> {
        let lost = self
            .begin(
                RecordedCall::Login {
                    identity: identity.to_string(),
                },
                None,
            )
            .await?;
        let state = self.state.lock().await;
        let session = match state.accounts.get(identity) {
            Some((expected, session)) if expected == password => session.clone(),
            _ => {
                return Err(ApiError::Permanent(
                    "Failed to authenticate. (400)".to_string(),
                ))
            }
        };
        drop(state);
        finish(session, lost)
    }

    async fn create_report(
        &self,
        session: &Session,
        fields: &ReportFields,
        token: &IdempotencyToken,
    ) -> ApiResult<RemoteReport> {
        let lost = self
            .begin(
                RecordedCall::Create {
                    token: token.as_str().to_string(),
                },
                Some(session),
            )
            .await?;
        let mut state = self.state.lock().await;
        // the token doubles as the record id, so a repeated create finds the first one
        if let Some(existing) = state.records.get(token.as_str()) {
            let existing = existing.clone();
            drop(state);
            return finish(existing, lost);
        }
        let record = RemoteReport {
            remote_id: token.as_str().to_string(),
            revision: state.next_revision(),
            fields: fields.clone(),
            files: Vec::new(),
        };
        state.records.insert(record.remote_id.clone(), record.clone());
        drop(state);
        finish(record, lost)
    }

    async fn update_report(
        &self,
        session: &Session,
        remote_id: &str,
        fields: &ReportFields,
        expected_revision: &str,
    ) -> ApiResult<RemoteReport> {
        let lost = self
            .begin(
                RecordedCall::Update {
                    remote_id: remote_id.to_string(),
                    expected_revision: expected_revision.to_string(),
                },
                Some(session),
            )
            .await?;
        let mut state = self.state.lock().await;
        let current = state
            .records
            .get(remote_id)
            .map(|record| record.revision.clone())
            .ok_or_else(|| ApiError::NotFound(remote_id.to_string()))?;
        if current != expected_revision {
            return Err(ApiError::Conflict(format!(
                "{remote_id} is at {current}, expected {expected_revision}"
            )));
        }
        let revision = state.next_revision();
        let record = state
            .records
            .get_mut(remote_id)
            .ok_or_else(|| ApiError::NotFound(remote_id.to_string()))?;
        record.fields = fields.clone();
        record.revision = revision;
        let record = record.clone();
        drop(state);
        finish(record, lost)
    }

    async fn delete_report(&self, session: &Session, remote_id: &str) -> ApiResult<()> {
        let lost = self
            .begin(
                RecordedCall::Delete {
                    remote_id: remote_id.to_string(),
                },
                Some(session),
            )
            .await?;
        let removed = self.state.lock().await.records.remove(remote_id);
        if removed.is_none() {
            return Err(ApiError::NotFound(remote_id.to_string()));
        }
        finish((), lost)
    }

    async fn fetch_report(&self, session: &Session, remote_id: &str) -> ApiResult<RemoteReport> {
        let lost = self
            .begin(
                RecordedCall::Fetch {
                    remote_id: remote_id.to_string(),
                },
                Some(session),
            )
            .await?;
        let record = self
            .state
            .lock()
            .await
            .records
            .get(remote_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(remote_id.to_string()))?;
        finish(record, lost)
    }

    async fn find_by_token(
        &self,
        session: &Session,
        token: &IdempotencyToken,
    ) -> ApiResult<Option<RemoteReport>> {
        let lost = self
            .begin(
                RecordedCall::FindByToken {
                    token: token.as_str().to_string(),
                },
                Some(session),
            )
            .await?;
        let record = self.state.lock().await.records.get(token.as_str()).cloned();
        finish(record, lost)
    }

    async fn upload_attachment(
        &self,
        session: &Session,
        remote_id: &str,
        upload: AttachmentUpload,
    ) -> ApiResult<UploadedAttachment> {
        let lost = self
            .begin(
                RecordedCall::Upload {
                    remote_id: remote_id.to_string(),
                    file_name: upload.file_name.clone(),
                },
                Some(session),
            )
            .await?;
        if upload.bytes.is_empty() {
            return Err(ApiError::Permanent("empty file".to_string()));
        }
        let mut state = self.state.lock().await;
        let revision = state.next_revision();
        let record = state
            .records
            .get_mut(remote_id)
            .ok_or_else(|| ApiError::NotFound(remote_id.to_string()))?;
        let url = format!(
            "memory://files/{remote_id}/{}-{}",
            record.files.len(),
            upload.file_name
        );
        record.files.push(url.clone());
        record.revision.clone_from(&revision);
        drop(state);
        finish(
            UploadedAttachment {
                url,
                report_revision: Some(revision),
            },
            lost,
        )
    }
}
