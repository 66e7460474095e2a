//! Catalog schema
//!
//! Two tables: `Origins(origin, quota)` and
//! `Databases(guid, origin, name, displayName, estimatedSize, path)`.
//! The catalog may have been created by another process, so each table is
//! created only when it is missing.

use rusqlite::Connection;

use crate::catalog::table_exists;
use crate::Result;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    if !table_exists(conn, "Origins")? {
        tracing::info!("Creating Origins table");
        conn.execute_batch(
            r#"
            CREATE TABLE Origins (
                origin TEXT UNIQUE ON CONFLICT REPLACE,
                quota INTEGER NOT NULL ON CONFLICT FAIL
            );
        "#,
        )?;
    }

    if !table_exists(conn, "Databases")? {
        tracing::info!("Creating Databases table");
        conn.execute_batch(
            r#"
            CREATE TABLE Databases (
                guid INTEGER PRIMARY KEY AUTOINCREMENT,
                origin TEXT,
                name TEXT,
                displayName TEXT,
                estimatedSize INTEGER,
                path TEXT
            );
        "#,
        )?;
    }

    Ok(())
}
