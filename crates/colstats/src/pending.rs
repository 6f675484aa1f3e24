//! Change applier.
//!
//! Drains the pending-change queue filled by the capture triggers, one change
//! per transaction, in queue order. Each change is diffed column by column
//! and folded into the stats and buckets as signed deltas.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::catalog::{describe_table, KeyColumns};
use crate::config::IndexerConfig;
use crate::ids::lookup;
use crate::store::{apply_delta, load_bucket, save_bucket, StatsDelta};
use crate::value::{decode_snapshot, index_terms, BucketKey, PrimaryKey, RowSnapshot, SqlValue};
use crate::Result;

/// One queued write, as captured by a trigger.
#[derive(Debug, Clone)]
struct PendingChange {
    id: i64,
    table: String,
    row_id: Option<i64>,
    /// Rowid before the write; differs from `row_id` when an update moves the row.
    old_row_id: Option<i64>,
    old: Option<String>,
    new: Option<String>,
}

fn oldest_change(conn: &Connection) -> Result<Option<PendingChange>> {
    let change = conn
        .query_row(
            "SELECT id, table_name, row_id, old_row_id, old, new FROM colstats_pending_rows ORDER BY id LIMIT 1",
            [],
            |row| {
                Ok(PendingChange {
                    id: row.get(0)?,
                    table: row.get(1)?,
                    row_id: row.get(2)?,
                    old_row_id: row.get(3)?,
                    old: row.get(4)?,
                    new: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(change)
}

/// Number of changes waiting to be applied.
pub fn queue_len(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT count(*) FROM colstats_pending_rows", [], |row| {
        row.get(0)
    })?;
    Ok(n as usize)
}

fn decode(json: Option<&str>, change: &PendingChange) -> RowSnapshot {
    let Some(json) = json else {
        return RowSnapshot::new();
    };
    decode_snapshot(json).unwrap_or_else(|| {
        tracing::warn!(
            "Ignoring unreadable snapshot in change {} on {}",
            change.id,
            change.table
        );
        RowSnapshot::new()
    })
}

/// Key of the row a snapshot describes. Missing key columns read as NULL.
fn row_key(key: &KeyColumns, snapshot: &RowSnapshot, row_id: Option<i64>) -> PrimaryKey {
    match key {
        KeyColumns::Rowid => PrimaryKey(vec![row_id.map_or(SqlValue::Null, SqlValue::Integer)]),
        KeyColumns::Declared(cols) => PrimaryKey(
            cols.iter()
                .map(|c| snapshot.get(c).cloned().unwrap_or(SqlValue::Null))
                .collect(),
        ),
    }
}

struct ColumnTarget<'a> {
    table_id: i64,
    column_id: i64,
    config: &'a IndexerConfig,
}

impl ColumnTarget<'_> {
    fn retract(&self, conn: &Connection, value: &SqlValue, pk: &PrimaryKey) -> Result<()> {
        let delta = StatsDelta::for_value(value, -1, self.config);
        if apply_delta(conn, self.table_id, self.column_id, &delta)? == 0 {
            return Ok(());
        }
        for term in index_terms(value, self.config.max_value_length) {
            let key = BucketKey::new(&term, self.config.key_length);
            if let Some(mut bucket) = load_bucket(conn, self.table_id, self.column_id, &key)? {
                bucket.remove(pk);
                save_bucket(conn, self.table_id, self.column_id, &key, &bucket)?;
            }
        }
        Ok(())
    }

    fn record(&self, conn: &Connection, value: &SqlValue, pk: &PrimaryKey) -> Result<()> {
        let delta = StatsDelta::for_value(value, 1, self.config);
        if apply_delta(conn, self.table_id, self.column_id, &delta)? == 0 {
            return Ok(());
        }
        for term in index_terms(value, self.config.max_value_length) {
            let key = BucketKey::new(&term, self.config.key_length);
            let mut bucket = load_bucket(conn, self.table_id, self.column_id, &key)?
                .unwrap_or_default();
            bucket.add(pk, self.config.max_samples);
            save_bucket(conn, self.table_id, self.column_id, &key, &bucket)?;
        }
        Ok(())
    }
}

fn apply_change(conn: &Connection, change: &PendingChange, config: &IndexerConfig) -> Result<()> {
    let Some(table_id) = lookup(conn, &change.table)? else {
        tracing::debug!("Dropping change {} for untracked table {}", change.id, change.table);
        return Ok(());
    };
    let Some(table) = describe_table(conn, &change.table)? else {
        tracing::debug!("Dropping change {} for missing table {}", change.id, change.table);
        return Ok(());
    };

    let old = decode(change.old.as_deref(), change);
    let new = decode(change.new.as_deref(), change);
    let old_pk = row_key(&table.key, &old, change.old_row_id.or(change.row_id));
    let new_pk = row_key(&table.key, &new, change.row_id);

    // A moved row is re-recorded in full so samples follow the new key
    let moved = !old.is_empty() && !new.is_empty() && old_pk != new_pk;

    let columns: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for column in columns {
        let Some(column_id) = lookup(conn, column)? else {
            continue;
        };
        let before = old.get(column);
        let after = new.get(column);
        if !moved && before == after {
            continue;
        }

        let target = ColumnTarget {
            table_id,
            column_id,
            config,
        };
        if let Some(value) = before {
            target.retract(conn, value, &old_pk)?;
        }
        if let Some(value) = after {
            target.record(conn, value, &new_pk)?;
        }
    }
    Ok(())
}

/// Apply the oldest queued change and remove it from the queue.
///
/// Changes are applied in queue order whether or not their column has been
/// backfilled yet, so a row written past the backfill cursor is counted by
/// both the scan and this change until the column is rebuilt.
///
/// Returns `false` when the queue is empty.
pub fn index_pending_rows(conn: &mut Connection, config: &IndexerConfig) -> Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some(change) = oldest_change(&tx)? else {
        return Ok(false);
    };

    apply_change(&tx, &change, config)?;
    tx.execute(
        "DELETE FROM colstats_pending_rows WHERE id = ?1",
        params![change.id],
    )?;
    tx.commit()?;

    tracing::debug!("Applied change {} on {}", change.id, change.table);
    Ok(true)
}
