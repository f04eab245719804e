//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_durable_queues(conn)?;
    }
    if current_version < 2 {
        migrate_v2_request_type_index(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: offline and periodic request queues.
///
/// `seq` is AUTOINCREMENT so ids are never reused after a drain empties a
/// table; insertion order survives restarts.
fn migrate_v1_durable_queues(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: durable queues");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS offline_requests (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            params TEXT NOT NULL,
            captured_at INTEGER NOT NULL,
            request_type INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS periodic_requests (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            params TEXT NOT NULL,
            captured_at INTEGER NOT NULL,
            request_type INTEGER NOT NULL
        );
        ",
    )?;

    record_migration(conn, 1, "durable_queues")?;
    Ok(())
}

/// V2: index for per-type counts shown by the status command.
fn migrate_v2_request_type_index(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: request type index");

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_offline_requests_type
            ON offline_requests(request_type);
        CREATE INDEX IF NOT EXISTS idx_periodic_requests_type
            ON periodic_requests(request_type);
        ",
    )?;

    record_migration(conn, 2, "request_type_index")?;
    Ok(())
}
