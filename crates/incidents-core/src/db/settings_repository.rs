//! Settings repository implementation

use crate::error::Result;
use crate::models::{Session, Settings};
use rusqlite::{params, Connection, OptionalExtension};

const KEY_API_BASE_URL: &str = "api_base_url";
const KEY_SESSION: &str = "session";

/// Trait for settings storage operations
pub trait SettingsRepository {
    /// Load settings from the database
    fn load(&self) -> Result<Settings>;

    /// Save settings to the database
    fn save(&self, settings: &Settings) -> Result<()>;
}

/// `SQLite` implementation of `SettingsRepository`
pub struct SqliteSettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_setting(&self, key: &str, value: Option<&str>) -> Result<()> {
        if let Some(value) = value {
            self.conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
                params![key, value],
            )?;
        } else {
            self.conn
                .execute("DELETE FROM settings WHERE key = ?", params![key])?;
        }
        Ok(())
    }
}

impl SettingsRepository for SqliteSettingsRepository<'_> {
    fn load(&self) -> Result<Settings> {
        let mut settings = Settings {
            api_base_url: self.get_setting(KEY_API_BASE_URL)?,
            ..Settings::default()
        };

        if let Some(raw) = self.get_setting(KEY_SESSION)? {
            match serde_json::from_str::<Session>(&raw) {
                Ok(session) if session.is_valid() => settings.session = Some(session),
                Ok(_) => {}
                Err(error) => tracing::warn!("Ignoring unreadable stored session: {error}"),
            }
        }

        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        self.set_setting(KEY_API_BASE_URL, settings.api_base_url.as_deref())?;
        let session = settings
            .session
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.set_setting(KEY_SESSION, session.as_deref())?;
        Ok(())
    }
}
