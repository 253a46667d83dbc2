//! Data models for Incidents

mod attachment;
mod conflict;
mod operation;
mod remote;
mod report;
mod session;
mod settings;

pub use attachment::{Attachment, AttachmentId, UploadStatus};
pub use conflict::{ConflictChoice, ReportConflict};
pub use operation::{ErrorKind, OperationId, OperationKind, OperationTarget, SyncOperation};
pub use remote::{RemoteReport, UploadedAttachment};
pub use report::{
    IdempotencyToken, IncidentReport, IncidentStatus, Location, ReportDraft, ReportField,
    ReportFields, ReportId, ReportPatch, SyncStatus,
};
pub use session::Session;
pub use settings::Settings;
