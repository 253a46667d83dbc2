//! incidents-core - Core library for Incidents
//!
//! Offline-first incident reporting: reports are written to a local `SQLite`
//! store, every change is queued, and the sync engine delivers the queue to
//! a `PocketBase` backend whenever connectivity and a session allow.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod net;
pub mod queue;
pub mod stager;
pub mod store;
pub mod sync;
mod util;

pub use config::{ApiConfig, SyncConfig};
pub use error::{Error, Result};
pub use models::{
    Attachment, AttachmentId, ConflictChoice, IncidentReport, ReportDraft, ReportId, ReportPatch,
    SyncStatus,
};
pub use net::{NetworkClient, PocketBaseClient, SessionContext};
pub use queue::SyncQueue;
pub use stager::AttachmentStager;
pub use store::LocalStore;
pub use sync::{ConnectivityMonitor, DrainReport, SyncEngine, SyncWorker};
