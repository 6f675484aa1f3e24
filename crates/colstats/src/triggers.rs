//! Change-capture triggers.
//!
//! Every indexable table gets an AFTER INSERT, AFTER UPDATE and AFTER DELETE
//! trigger that appends one row to the pending-change queue inside the
//! writer's own transaction. Each snapshot is a JSON object mapping column
//! name to a `[typeof, payload]` pair; blob payloads are hex-encoded because
//! JSON cannot carry them directly.

use std::collections::HashSet;

use rusqlite::{Connection, TransactionBehavior};

use crate::catalog::{indexable_schema, SourceTable};
use crate::db::{quote_ident, quote_literal};
use crate::schema::{is_engine_owned, PENDING_ROWS, PREFIX};
use crate::Result;

/// SQLite caps function arguments, so wide rows are built from several
/// `json_object` calls merged with `json_patch`.
const COLUMNS_PER_OBJECT: usize = 50;

/// The kind of write a trigger fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl WriteKind {
    pub const ALL: [WriteKind; 3] = [WriteKind::Insert, WriteKind::Update, WriteKind::Delete];

    fn keyword(self) -> &'static str {
        match self {
            WriteKind::Insert => "INSERT",
            WriteKind::Update => "UPDATE",
            WriteKind::Delete => "DELETE",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            WriteKind::Insert => "insert",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        }
    }
}

/// A trigger, identified by name, table and exact SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriggerDef {
    pub name: String,
    pub table: String,
    pub sql: String,
}

/// What [`ensure_triggers`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerReport {
    pub created: usize,
    pub dropped: usize,
}

fn tagged_column(alias: &str, column: &str) -> String {
    let col = format!("{}.{}", alias, quote_ident(column));
    format!(
        "{name}, json_array(typeof({col}), CASE typeof({col}) WHEN 'blob' THEN hex({col}) ELSE {col} END)",
        name = quote_literal(column),
        col = col
    )
}

fn snapshot_expr(alias: &str, table: &SourceTable) -> String {
    let objects: Vec<String> = table
        .columns
        .chunks(COLUMNS_PER_OBJECT)
        .map(|chunk| {
            let pairs: Vec<String> = chunk
                .iter()
                .map(|c| tagged_column(alias, &c.name))
                .collect();
            format!("json_object({})", pairs.join(", "))
        })
        .collect();

    objects
        .into_iter()
        .reduce(|acc, next| format!("json_patch({}, {})", acc, next))
        .unwrap_or_else(|| "json_object()".to_string())
}

/// Build the trigger for one table and write kind.
pub fn synthesize(table: &SourceTable, kind: WriteKind) -> TriggerDef {
    let name = format!("{}{}_{}", PREFIX, table.name, kind.suffix());

    let (row_alias, old, new) = match kind {
        WriteKind::Insert => ("new", "NULL".to_string(), snapshot_expr("new", table)),
        WriteKind::Update => (
            "new",
            snapshot_expr("old", table),
            snapshot_expr("new", table),
        ),
        WriteKind::Delete => ("old", snapshot_expr("old", table), "NULL".to_string()),
    };

    // Updates may rewrite the rowid itself, so the old one is kept as well
    let (row_id, old_row_id) = match (table.without_rowid, kind) {
        (true, _) => ("NULL".to_string(), "NULL".to_string()),
        (false, WriteKind::Insert) => (format!("{}.rowid", row_alias), "NULL".to_string()),
        (false, _) => (format!("{}.rowid", row_alias), "old.rowid".to_string()),
    };

    let sql = format!(
        "CREATE TRIGGER {name} AFTER {kind} ON {table} BEGIN\n  INSERT INTO {queue}(table_name, row_id, old_row_id, old, new) VALUES ({literal}, {row_id}, {old_row_id}, {old}, {new});\nEND",
        name = quote_ident(&name),
        kind = kind.keyword(),
        table = quote_ident(&table.name),
        queue = PENDING_ROWS,
        literal = quote_literal(&table.name),
        row_id = row_id,
        old_row_id = old_row_id,
        old = old,
        new = new,
    );

    TriggerDef {
        name,
        table: table.name.clone(),
        sql,
    }
}

/// Triggers that should exist for the given tables.
pub fn expected_triggers(tables: &[SourceTable]) -> Vec<TriggerDef> {
    tables
        .iter()
        .flat_map(|t| WriteKind::ALL.iter().map(move |k| synthesize(t, *k)))
        .collect()
}

/// Triggers currently installed that belong to the indexer.
pub fn installed_triggers(conn: &Connection) -> Result<Vec<TriggerDef>> {
    let mut stmt =
        conn.prepare("SELECT name, tbl_name, sql FROM sqlite_master WHERE type = 'trigger'")?;
    let triggers = stmt
        .query_map([], |row| {
            Ok(TriggerDef {
                name: row.get(0)?,
                table: row.get(1)?,
                sql: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(triggers
        .into_iter()
        .filter(|t| is_engine_owned(&t.name))
        .collect())
}

/// Reconcile installed triggers with the expected set.
///
/// Drops engine triggers that are stale or no longer wanted, then creates
/// the missing ones. Safe to re-run after source schema changes.
pub fn ensure_triggers(conn: &mut Connection) -> Result<TriggerReport> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let expected: HashSet<TriggerDef> = expected_triggers(&indexable_schema(&tx)?)
        .into_iter()
        .collect();
    let installed: HashSet<TriggerDef> = installed_triggers(&tx)?.into_iter().collect();

    let mut report = TriggerReport::default();

    for stale in installed.difference(&expected) {
        tx.execute_batch(&format!("DROP TRIGGER IF EXISTS {}", quote_ident(&stale.name)))?;
        report.dropped += 1;
    }

    for missing in expected.difference(&installed) {
        tx.execute_batch(&missing.sql)?;
        report.created += 1;
    }

    tx.commit()?;

    if report.created > 0 || report.dropped > 0 {
        tracing::info!(
            "Reconciled triggers: {} created, {} dropped",
            report.created,
            report.dropped
        );
    }
    Ok(report)
}
