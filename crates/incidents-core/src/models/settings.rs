//! Locally persisted client settings

use serde::{Deserialize, Serialize};

use super::session::Session;

/// Client settings stored in the local database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Runtime override of the API base URL; wins over the environment
    pub api_base_url: Option<String>,
    /// Session restored on startup, cleared at logout
    pub session: Option<Session>,
}
