//! Database migrations

use crate::error::Result;
use rusqlite::{params, Connection};

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        apply(conn, 1, MIGRATION_V1)?;
    }
    if version < 2 {
        apply(conn, 2, MIGRATION_V2)?;
    }
    if version < 3 {
        apply(conn, 3, MIGRATION_V3)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Run one migration's statements in a single transaction
fn apply(conn: &mut Connection, version: i32, statements: &[&str]) -> Result<()> {
    let tx = conn.transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        params![version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Version 1: reports and settings
const MIGRATION_V1: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS reports (
        id TEXT PRIMARY KEY,
        remote_id TEXT UNIQUE,
        idempotency_token TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        incident_type TEXT NOT NULL,
        status TEXT NOT NULL,
        latitude REAL,
        longitude REAL,
        occurred_at INTEGER NOT NULL,
        attachments TEXT NOT NULL DEFAULT '[]',
        sync_status TEXT NOT NULL,
        revision INTEGER NOT NULL,
        remote_revision TEXT,
        synced_fields TEXT,
        conflict TEXT,
        last_error TEXT,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_reports_updated ON reports(updated_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_reports_sync_status ON reports(sync_status)",
    // Settings table (local only)
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

/// Version 2: staged attachments
const MIGRATION_V2: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS attachments (
        id TEXT PRIMARY KEY,
        report_id TEXT NOT NULL,
        file_name TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        local_path TEXT,
        size_bytes INTEGER NOT NULL,
        remote_url TEXT,
        upload_status TEXT NOT NULL,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_attachments_report_id ON attachments(report_id)",
    "CREATE INDEX IF NOT EXISTS idx_attachments_status ON attachments(upload_status)",
];

/// Version 3: durable sync queue
const MIGRATION_V3: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sync_operations (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        entity_id TEXT NOT NULL,
        report_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT,
        base_revision INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        next_eligible_at INTEGER NOT NULL,
        last_error_kind TEXT,
        last_error TEXT,
        inflight INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_operations_entity ON sync_operations(entity_id, seq)",
    "CREATE INDEX IF NOT EXISTS idx_sync_operations_eligible ON sync_operations(next_eligible_at)",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
            params![name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_migrations() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        for table in ["reports", "attachments", "sync_operations", "settings"] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }
}
