//! Error types for incidents-core

use thiserror::Error;

/// Result type alias using incidents-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in incidents-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// `SQLite` error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Report, attachment, or operation not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attachment storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// The entity's sync state does not allow the requested action
    #[error("Invalid sync state: {0}")]
    Conflict(String),

    /// Session missing or rejected by the remote service
    #[error("Session error: {0}")]
    Session(String),

    /// Remote API call failed
    #[error(transparent)]
    Api(#[from] crate::net::ApiError),
}
