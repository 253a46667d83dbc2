//! Sync conflict model

use serde::{Deserialize, Serialize};

use super::remote::RemoteReport;
use super::report::{ReportField, ReportFields};

/// Both sides of an edit conflict that needs a user decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportConflict {
    /// Local field values at the time the conflict was detected
    pub local: ReportFields,
    /// Server state observed when the conflict was detected
    pub remote: RemoteReport,
    /// Fields changed on both sides to different values
    pub fields: Vec<ReportField>,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
}

/// User decision for a report in `Conflict`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictChoice {
    /// Overwrite the server with the local edit
    KeepLocal,
    /// Discard the local edit and adopt the server version
    KeepRemote,
    /// Submit a hand-merged version
    Merged(ReportFields),
}
