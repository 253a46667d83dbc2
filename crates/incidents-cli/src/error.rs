use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] incidents_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Report ID cannot be empty")]
    EmptyReportId,
    #[error("Report not found for id/prefix: {0}")]
    ReportNotFound(String),
    #[error("{0}")]
    AmbiguousReportId(String),
    #[error("Nothing to change; pass at least one field to edit")]
    EmptyEdit,
    #[error("Cannot attach {0}: not a file")]
    NotAFile(String),
    #[error("Failed to resolve the data directory; pass --db-path")]
    DataDirUnavailable,
    #[error(
        "The server is not configured. Set POCKETBASE_URL or run `incidents config set-url <URL>`."
    )]
    ApiNotConfigured,
    #[error("Not logged in. Run `incidents login --email <EMAIL> --password <PASSWORD>`.")]
    NotLoggedIn,
}
