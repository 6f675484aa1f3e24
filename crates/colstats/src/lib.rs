//! colstats: incremental column statistics for mutable SQLite databases
//!
//! This crate keeps approximate, continuously-updated statistics and a
//! distinct-value index over the columns of a watched database:
//! - Per-column aggregates (type counts, length bounds, min/max) for shape inference
//! - A truncated+hashed distinct-value index for autocomplete
//! - Change-capture triggers feeding a pending-change queue
//! - A resumable backfill scanner and a queue applier driven by a cooperative scheduler

pub mod backfill;
pub mod catalog;
pub mod config;
pub mod db;
pub mod ids;
pub mod pending;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod suggest;
pub mod triggers;
pub mod value;

// Re-export main types
pub use config::IndexerConfig;
pub use db::{Database, SqliteDatabase};
pub use scheduler::{reindex, uninstall, Engine, ReindexReport};
pub use store::ColumnStats;
pub use suggest::{autosuggest, Suggestion};
pub use value::{PrimaryKey, SqlValue};

/// Errors that can occur while maintaining the index
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Failed to (de)serialize JSON: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to create {table}: schema does not round-trip\nexpected: {expected}\nactual: {actual}")]
    SchemaMismatch {
        table: String,
        expected: String,
        actual: String,
    },

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Background indexing task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mismatch_message_names_table() {
        let err = IndexError::SchemaMismatch {
            table: "colstats_ids".to_string(),
            expected: "CREATE TABLE a".to_string(),
            actual: "CREATE TABLE b".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("colstats_ids"));
        assert!(msg.contains("expected: CREATE TABLE a"));
    }

    #[test]
    fn test_rusqlite_error_converts() {
        let err: IndexError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, IndexError::DatabaseError(_)));
    }
}
