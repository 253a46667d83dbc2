//! Remote API seam.
//!
//! [`NetworkClient`] is what the sync engine talks to. `PocketBaseClient`
//! speaks to a real server; `MemoryBackend` is an in-process server used in
//! tests and demos.

mod memory;
mod pocketbase;
mod session;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    ErrorKind, IdempotencyToken, RemoteReport, ReportFields, Session, UploadedAttachment,
};

pub use memory::{Fault, MemoryBackend, RecordedCall};
pub use pocketbase::PocketBaseClient;
pub use session::SessionContext;

/// Failure reported by a [`NetworkClient`] call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Network or server trouble that may clear up on retry
    #[error("Temporary API failure: {0}")]
    Transient(String),
    #[error("Request timed out")]
    Timeout,
    /// The server rejected the request; retrying will not help
    #[error("Request rejected: {0}")]
    Permanent(String),
    /// The record changed on the server since the expected revision
    #[error("Version conflict: {0}")]
    Conflict(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Not authorized: {0}")]
    Unauthorized(String),
}

impl ApiError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Timeout => ErrorKind::Timeout,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout)
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Bytes and metadata of one attachment upload.
#[derive(Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for AttachmentUpload {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AttachmentUpload")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// Report CRUD and attachment upload against the remote service.
///
/// Creates are idempotent on `token`: repeating a create that already
/// succeeded returns the existing record.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn login(&self, identity: &str, password: &str) -> ApiResult<Session>;

    async fn create_report(
        &self,
        session: &Session,
        fields: &ReportFields,
        token: &IdempotencyToken,
    ) -> ApiResult<RemoteReport>;

    /// Fails with [`ApiError::Conflict`] unless the record is still at
    /// `expected_revision`.
    async fn update_report(
        &self,
        session: &Session,
        remote_id: &str,
        fields: &ReportFields,
        expected_revision: &str,
    ) -> ApiResult<RemoteReport>;

    async fn delete_report(&self, session: &Session, remote_id: &str) -> ApiResult<()>;

    async fn fetch_report(&self, session: &Session, remote_id: &str) -> ApiResult<RemoteReport>;

    /// Find the record a create with `token` produced, if any.
    async fn find_by_token(
        &self,
        session: &Session,
        token: &IdempotencyToken,
    ) -> ApiResult<Option<RemoteReport>>;

    async fn upload_attachment(
        &self,
        session: &Session,
        remote_id: &str,
        upload: AttachmentUpload,
    ) -> ApiResult<UploadedAttachment>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(ApiError::Transient("503".to_string()).is_retryable());
        assert!(ApiError::Timeout.is_retryable());
        assert!(!ApiError::Permanent("400".to_string()).is_retryable());
        assert!(!ApiError::Unauthorized("401".to_string()).is_retryable());
        assert_eq!(ApiError::Timeout.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn upload_debug_hides_bytes() {
        let upload = AttachmentUpload {
            file_name: "a.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            bytes: vec![0; 2048],
        };
        let debug = format!("{upload:?}");
        assert!(debug.contains("2048"));
        assert!(!debug.contains("[0, 0"));
    }
}
