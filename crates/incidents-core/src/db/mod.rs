//! Database layer for Incidents

mod connection;
mod migrations;
pub(crate) mod rows;
mod settings_repository;

pub use connection::{Database, SharedDatabase};
pub use settings_repository::{SettingsRepository, SqliteSettingsRepository};
