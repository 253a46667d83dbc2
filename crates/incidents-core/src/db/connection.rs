//! Database connection management

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::migrations;

/// Database handle shared by the local store, sync queue and attachment stager.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Database wrapper for a `SQLite` connection
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations and releases work interrupted by a previous crash.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        let mut database = Self { conn };
        database.configure()?;
        database.migrate()?;
        database.recover_interrupted()?;
        Ok(database)
    }

    /// Wrap this database for sharing across components.
    #[must_use]
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Configure `SQLite` for durability and concurrency
    fn configure(&self) -> Result<()> {
        // In-memory databases report "memory" instead of switching to WAL
        self.conn
            .query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))
            .ok();
        self.conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&mut self) -> Result<()> {
        migrations::run(&mut self.conn)
    }

    /// Return operations and uploads left in flight by a crash to the queue.
    fn recover_interrupted(&self) -> Result<()> {
        let operations = self.conn.execute(
            "UPDATE sync_operations SET inflight = 0 WHERE inflight = 1",
            [],
        )?;
        let uploads = self.conn.execute(
            "UPDATE attachments SET upload_status = 'pending' WHERE upload_status = 'uploading'",
            [],
        )?;
        if operations > 0 || uploads > 0 {
            tracing::info!(
                operations,
                uploads,
                "Released work interrupted by previous shutdown"
            );
        }
        Ok(())
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get a mutable reference, needed to open transactions
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
