//! Auxiliary tables owned by the indexer.
//!
//! Everything in these tables is derivable from the source tables, so schema
//! drift is handled bluntly: if any table's stored DDL differs from what this
//! build expects, all of them are dropped and recreated and the backfill
//! starts over.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::db::quote_ident;
use crate::{IndexError, Result};

/// Prefix shared by every table and trigger the indexer creates.
pub const PREFIX: &str = "colstats_";

pub const IDS: &str = "colstats_ids";
pub const COLUMN_STATS: &str = "colstats_column_stats";
pub const COLUMN_STATS_OPS: &str = "colstats_column_stats_ops";
pub const COLUMN_STATS_VALUES: &str = "colstats_column_stats_values";
pub const PENDING_ROWS: &str = "colstats_pending_rows";

const CREATE_IDS: &str = "CREATE TABLE colstats_ids(
  id integer primary key,
  name text not null unique
)";

// Counters default to zero so rows can be provisioned before any scan.
const CREATE_COLUMN_STATS: &str = "CREATE TABLE colstats_column_stats(
  table_id integer not null references colstats_ids(id),
  column_id integer not null references colstats_ids(id),
  type text not null,
  nullable boolean not null,
  pk boolean not null,
  min,
  max,
  count integer not null default 0,
  nulls integer not null default 0,
  integers integer not null default 0,
  reals integer not null default 0,
  texts integer not null default 0,
  blobs integer not null default 0,
  json_strings integer not null default 0,
  json_arrays integer not null default 0,
  json_objects integer not null default 0,
  texts_min_length integer,
  texts_max_length integer,
  texts_whitespace integer not null default 0,
  texts_newline integer not null default 0,
  blobs_min_length integer,
  blobs_max_length integer,
  primary key (table_id, column_id)
)";

const CREATE_COLUMN_STATS_OPS: &str = "CREATE TABLE colstats_column_stats_ops(
  table_id integer not null references colstats_ids(id),
  column_id integer not null references colstats_ids(id),
  last_key text,
  pending integer not null check (pending in (0, 1)),
  updated_at text not null default '1970-01-01 00:00:00.000',
  primary key (table_id, column_id)
)";

const CREATE_COLUMN_STATS_VALUES: &str = "CREATE TABLE colstats_column_stats_values(
  table_id integer not null references colstats_ids(id),
  column_id integer not null references colstats_ids(id),
  value text not null,
  hash text not null,
  count integer not null,
  pks text not null,
  primary key (table_id, column_id, value, hash)
)";

const CREATE_PENDING_ROWS: &str = "CREATE TABLE colstats_pending_rows(
  id integer primary key autoincrement,
  table_name text not null,
  row_id integer,
  old_row_id integer,
  old text,
  new text,
  created_at text not null default (strftime('%Y-%m-%d %H:%M:%f', 'now'))
)";

/// Table definitions in dependency order.
pub const TABLES: &[(&str, &str)] = &[
    (IDS, CREATE_IDS),
    (COLUMN_STATS, CREATE_COLUMN_STATS),
    (COLUMN_STATS_OPS, CREATE_COLUMN_STATS_OPS),
    (COLUMN_STATS_VALUES, CREATE_COLUMN_STATS_VALUES),
    (PENDING_ROWS, CREATE_PENDING_ROWS),
];

/// Whether a table or trigger name belongs to the indexer.
pub fn is_engine_owned(name: &str) -> bool {
    name.starts_with(PREFIX)
}

fn stored_sql(conn: &Connection, name: &str) -> Result<Option<String>> {
    let sql = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(sql)
}

/// Whether the indexer's tables are present at all.
pub fn is_installed(conn: &Connection) -> Result<bool> {
    Ok(stored_sql(conn, IDS)?.is_some())
}

/// Make sure every auxiliary table exists with the expected DDL.
///
/// Returns `true` if the tables were (re)created. Fails if a freshly created
/// table does not read back with exactly the expected text.
pub fn ensure_schema(conn: &mut Connection) -> Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut all_ok = true;
    for (table, sql) in TABLES {
        if stored_sql(&tx, table)?.as_deref() != Some(*sql) {
            all_ok = false;
            break;
        }
    }

    if all_ok {
        return Ok(false);
    }

    // Drop in reverse order so foreign keys don't get in the way
    for (table, _) in TABLES.iter().rev() {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))?;
    }

    for (table, sql) in TABLES {
        tx.execute_batch(sql)?;

        let roundtrip = stored_sql(&tx, table)?.unwrap_or_default();
        if roundtrip != *sql {
            return Err(IndexError::SchemaMismatch {
                table: table.to_string(),
                expected: sql.to_string(),
                actual: roundtrip,
            });
        }
    }

    tx.commit()?;
    tracing::info!("Rebuilt colstats tables; statistics restart from zero");
    Ok(true)
}

/// Drop every trigger and table the indexer created.
pub fn uninstall(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let owned = |kind: &str| -> Result<Vec<String>> {
        let mut stmt = tx.prepare("SELECT name FROM sqlite_master WHERE type = ?1")?;
        let names = stmt
            .query_map(params![kind], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names.into_iter().filter(|n| is_engine_owned(n)).collect())
    };

    let triggers = owned("trigger")?;
    let tables = owned("table")?;

    for trigger in &triggers {
        tx.execute_batch(&format!("DROP TRIGGER {}", quote_ident(trigger)))?;
    }

    // Reverse dependency order for the tables we know about, then any strays
    let known: Vec<&str> = TABLES.iter().rev().map(|(t, _)| *t).collect();
    let strays = tables.iter().filter(|t| !known.contains(&t.as_str()));
    for table in known.iter().copied().chain(strays.map(String::as_str)) {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))?;
    }

    tx.commit()?;
    tracing::info!(
        "Removed {} colstats triggers and {} tables",
        triggers.len(),
        tables.len()
    );
    Ok(())
}
