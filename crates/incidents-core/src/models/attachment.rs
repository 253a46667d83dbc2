//! Attachment model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::report::ReportId;

/// A unique identifier for an attachment, using UUID v7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttachmentId(Uuid);

impl AttachmentId {
    /// Create a new unique attachment ID using UUID v7.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID.
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for AttachmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AttachmentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Upload state of a staged attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl UploadStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Failed => "failed",
        }
    }

    /// Local bytes are still the only copy and must be kept.
    #[must_use]
    pub const fn holds_unsynced_data(self) -> bool {
        matches!(self, Self::Pending | Self::Uploading)
    }
}

impl FromStr for UploadStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "uploading" => Ok(Self::Uploading),
            "uploaded" => Ok(Self::Uploaded),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!("unknown upload status: {other}"))),
        }
    }
}

/// Attachment metadata persisted for a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Unique attachment identifier.
    pub id: AttachmentId,
    /// Owning report identifier.
    pub report_id: ReportId,
    /// Original file name.
    pub file_name: String,
    /// Content MIME type.
    pub mime_type: String,
    /// Managed local copy of the bytes; `None` once purged.
    pub local_path: Option<PathBuf>,
    /// Attachment size in bytes.
    pub size_bytes: i64,
    /// Stable URL assigned by the server after upload.
    pub remote_url: Option<String>,
    pub upload_status: UploadStatus,
    pub last_error: Option<String>,
    /// Creation timestamp (Unix ms).
    pub created_at: i64,
    /// Last status change (Unix ms).
    pub updated_at: i64,
}

impl Attachment {
    /// Create a new attachment metadata record.
    pub fn new(
        report_id: ReportId,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        size_bytes: i64,
    ) -> Result<Self> {
        let file_name = file_name.into().trim().to_string();
        let mime_type = mime_type.into().trim().to_string();

        if file_name.is_empty() {
            return Err(Error::InvalidInput(
                "Attachment file_name cannot be empty".to_string(),
            ));
        }
        if mime_type.is_empty() {
            return Err(Error::InvalidInput(
                "Attachment mime_type cannot be empty".to_string(),
            ));
        }
        if size_bytes < 0 {
            return Err(Error::InvalidInput(
                "Attachment size_bytes cannot be negative".to_string(),
            ));
        }

        let now = chrono::Utc::now().timestamp_millis();
        Ok(Self {
            id: AttachmentId::new(),
            report_id,
            file_name,
            mime_type,
            local_path: None,
            size_bytes,
            remote_url: None,
            upload_status: UploadStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }
}
