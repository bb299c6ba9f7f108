//! Database migrations.
//!
//! SQL is embedded as strings and executed when a database is opened.
//! The batch is idempotent; re-running it is safe.

use crate::error::Result;
use rusqlite::Connection;

/// Engine tables SQL (001)
pub const ENGINE_TABLES_SQL: &str = include_str!("001_engine_tables.sql");

/// Run all migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(ENGINE_TABLES_SQL)?;
    Ok(())
}
