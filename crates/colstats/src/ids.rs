//! Identifier interner.
//!
//! Table and column names are mapped to small integers once; every other
//! auxiliary table keys on those ids. Ids are append-only and never reused.

use rusqlite::{params, Connection, OptionalExtension};

use crate::Result;

/// Return the id for `name`, allocating one if needed.
pub fn intern(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO colstats_ids(name) VALUES (?1)",
        params![name],
    )?;
    let id = conn.query_row(
        "SELECT id FROM colstats_ids WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Return the id for `name` without allocating.
pub fn lookup(conn: &Connection, name: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM colstats_ids WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}
