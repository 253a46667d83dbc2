//! Sync queue operation model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::attachment::AttachmentId;
use super::report::{ReportFields, ReportId};

/// A unique identifier for a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Upload,
}

impl OperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Upload => "upload",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "upload" => Ok(Self::Upload),
            other => Err(Error::InvalidInput(format!(
                "unknown operation kind: {other}"
            ))),
        }
    }
}

/// The entity an operation applies to.
///
/// Queue ordering and coalescing are keyed by [`OperationTarget::entity_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationTarget {
    Report(ReportId),
    Attachment {
        attachment: AttachmentId,
        report: ReportId,
    },
}

impl OperationTarget {
    #[must_use]
    pub fn entity_key(&self) -> String {
        match self {
            Self::Report(id) => id.as_str(),
            Self::Attachment { attachment, .. } => attachment.as_str(),
        }
    }

    /// The report this operation belongs to (the owner, for attachments).
    #[must_use]
    pub const fn report_id(&self) -> ReportId {
        match self {
            Self::Report(id) | Self::Attachment { report: id, .. } => *id,
        }
    }
}

/// Classification of the last failure recorded on an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Timeout,
    Permanent,
    Conflict,
    NotFound,
    Unauthorized,
    Storage,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Permanent => "permanent",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Storage => "storage",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(Self::Transient),
            "timeout" => Ok(Self::Timeout),
            "permanent" => Ok(Self::Permanent),
            "conflict" => Ok(Self::Conflict),
            "not_found" => Ok(Self::NotFound),
            "unauthorized" => Ok(Self::Unauthorized),
            "storage" => Ok(Self::Storage),
            other => Err(Error::InvalidInput(format!("unknown error kind: {other}"))),
        }
    }
}

/// An operation waiting in the sync queue.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOperation {
    pub id: OperationId,
    /// Insertion order; FIFO within an entity
    pub seq: i64,
    pub target: OperationTarget,
    pub kind: OperationKind,
    /// Field snapshot at enqueue time (Create/Update only)
    pub payload: Option<ReportFields>,
    /// Local report revision the payload was taken from
    pub base_revision: i64,
    pub attempts: u32,
    /// Earliest dispatch time (Unix ms)
    pub next_eligible_at: i64,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl SyncOperation {
    #[must_use]
    pub fn report_id(&self) -> ReportId {
        self.target.report_id()
    }
}
