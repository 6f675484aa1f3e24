//! Enumeration of the source schema.
//!
//! Decides which tables are indexable and describes their columns and
//! primary keys. Virtual tables, their shadow tables, SQLite internals and
//! the indexer's own tables are never indexed.

use rusqlite::{params, Connection};

use crate::db::quote_ident;
use crate::schema::is_engine_owned;
use crate::Result;

/// A column of a source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceColumn {
    pub name: String,
    /// Declared type, as written (may be empty).
    pub decl_type: String,
    pub nullable: bool,
    pub pk: bool,
}

/// How rows of a table are identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyColumns {
    /// No declared primary key; rows are addressed by the native rowid.
    Rowid,
    /// Declared primary key columns, in key order.
    Declared(Vec<String>),
}

impl KeyColumns {
    /// Comma-separated select list for the key columns.
    pub fn select_list(&self) -> String {
        match self {
            KeyColumns::Rowid => "rowid".to_string(),
            KeyColumns::Declared(cols) => cols
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            KeyColumns::Rowid => 1,
            KeyColumns::Declared(cols) => cols.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(k1, k2) > (?, ?)`-style predicate with placeholders starting at `first`.
    pub fn compare_predicate(&self, op: &str, first: usize) -> String {
        let placeholders = (0..self.len())
            .map(|i| format!("?{}", first + i))
            .collect::<Vec<_>>()
            .join(", ");
        format!("({}) {} ({})", self.select_list(), op, placeholders)
    }
}

/// A source table with its columns and key.
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub name: String,
    pub columns: Vec<SourceColumn>,
    pub key: KeyColumns,
    pub without_rowid: bool,
}

/// Names of all indexable tables, sorted.
pub fn indexable_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM pragma_table_list
         WHERE schema = 'main' AND type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
         ORDER BY name",
    )?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    // Shadow tables are named after their virtual table, e.g. `docs_fts_data`
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND sql LIKE 'CREATE VIRTUAL TABLE%'",
    )?;
    let virtual_tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(tables
        .into_iter()
        .filter(|t| !is_engine_owned(t))
        .filter(|t| {
            !virtual_tables
                .iter()
                .any(|v| t == v || t.starts_with(&format!("{}_", v)))
        })
        .collect())
}

/// Describe a table. Returns `None` if it doesn't exist.
pub fn describe_table(conn: &Connection, table: &str) -> Result<Option<SourceTable>> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let rows: Vec<(String, String, bool, i64)> = stmt
        .query_map(params![table], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut key_columns: Vec<(i64, String)> = rows
        .iter()
        .filter(|(_, _, _, pk)| *pk > 0)
        .map(|(name, _, _, pk)| (*pk, name.clone()))
        .collect();
    key_columns.sort();

    let key = if key_columns.is_empty() {
        KeyColumns::Rowid
    } else {
        KeyColumns::Declared(key_columns.into_iter().map(|(_, n)| n).collect())
    };

    let without_rowid: bool = conn
        .query_row(
            "SELECT coalesce(max(wr), 0) FROM pragma_table_list WHERE schema = 'main' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;

    let columns = rows
        .into_iter()
        .map(|(name, decl_type, notnull, pk)| SourceColumn {
            name,
            decl_type,
            nullable: !notnull,
            pk: pk > 0,
        })
        .collect();

    Ok(Some(SourceTable {
        name: table.to_string(),
        columns,
        key,
        without_rowid,
    }))
}

/// Describe every indexable table.
pub fn indexable_schema(conn: &Connection) -> Result<Vec<SourceTable>> {
    let mut tables = Vec::new();
    for name in indexable_tables(conn)? {
        if let Some(table) = describe_table(conn, &name)? {
            tables.push(table);
        }
    }
    Ok(tables)
}
