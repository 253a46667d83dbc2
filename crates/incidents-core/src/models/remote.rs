//! Server-side view of a report

use serde::{Deserialize, Serialize};

use super::report::ReportFields;

/// A report as stored by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteReport {
    pub remote_id: String,
    /// Opaque server version token
    pub revision: String,
    pub fields: ReportFields,
    /// Stable URLs of files attached on the server
    #[serde(default)]
    pub files: Vec<String>,
}

/// Result of a successful attachment upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAttachment {
    pub url: String,
    /// New revision of the parent record, when the upload touched it
    pub report_revision: Option<String>,
}
