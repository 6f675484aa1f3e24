//! Storage capability consumed by the indexer.
//!
//! The engine never owns the watched database. The host hands it something
//! implementing [`Database`], and every read, write, trigger install and
//! schema lookup goes through the connection that trait lends out.
//!
//! # Examples
//!
//! ```
//! use colstats::{Database, SqliteDatabase};
//!
//! let db = SqliteDatabase::in_memory("scratch").unwrap();
//! let n: i64 = db
//!     .with_connection(|conn| Ok(conn.query_row("SELECT 1 + 1", [], |r| r.get(0))?))
//!     .unwrap();
//! assert_eq!(n, 2);
//! ```

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;

use crate::{IndexError, Result};

/// How long a statement waits on a lock held by a foreground writer.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A watched database, as seen by the indexer.
///
/// Implementations must serialize access: the closure passed to
/// [`with_connection`](Database::with_connection) gets exclusive use of the
/// connection for its whole duration, so multi-statement transactions are
/// safe inside it.
pub trait Database: Send + Sync + 'static {
    /// Display name, used in logs.
    fn name(&self) -> &str;

    /// Run `f` with exclusive access to a connection.
    fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T>;
}

/// A [`Database`] backed by a single rusqlite connection.
pub struct SqliteDatabase {
    name: String,
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    /// Open an existing database file. Fails if it doesn't exist.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(IndexError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Database not found: {}", path.display()),
            )));
        }

        let conn = Connection::open(path)?;
        prepare_connection(&conn)?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            name,
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (useful for testing).
    pub fn in_memory(name: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            name: name.to_string(),
            path: None,
            conn: Mutex::new(conn),
        })
    }

    /// File backing this database, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Database for SqliteDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        // A panic inside an earlier closure poisons the lock; the connection
        // itself is still usable since every write runs in its own transaction.
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

/// Connection setup for file databases shared with foreground writers.
fn prepare_connection(conn: &Connection) -> Result<()> {
    // WAL lets foreground readers proceed while a chunk commits
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for interpolation into SQL (trigger bodies).
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_database() {
        let db = SqliteDatabase::in_memory("mem").unwrap();
        assert_eq!(db.name(), "mem");
        assert!(db.path().is_none());
        let fk: i64 = db
            .with_connection(|conn| Ok(conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_open_fails_if_not_exists() {
        let result = SqliteDatabase::open(Path::new("/nonexistent/path.db"));
        assert!(result.is_err());
    }

    #[test]
    fn test_open_file_uses_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("data.db");
        Connection::open(&db_path).unwrap();

        let db = SqliteDatabase::open(&db_path).unwrap();
        assert_eq!(db.name(), "data");
        let mode: String = db
            .with_connection(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("o'neil"), "'o''neil'");
    }
}
