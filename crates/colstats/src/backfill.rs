//! Resumable backfill scanner.
//!
//! Each call advances one column by one chunk: rows are read in primary key
//! order starting after the column's persisted cursor, aggregated in SQL,
//! bucketed in Rust, and the cursor moves to the chunk's last key. A column
//! is done when a chunk comes back short.

use std::collections::BTreeMap;

use rusqlite::{params_from_iter, Connection, TransactionBehavior};

use crate::catalog::{describe_table, KeyColumns};
use crate::config::IndexerConfig;
use crate::db::quote_ident;
use crate::store::{
    advance_cursor, apply_delta, load_bucket, next_pending_cursor, save_bucket, Cursor, StatsDelta,
};
use crate::value::{array_terms, scalar_term, BucketKey, PrimaryKey, SqlValue};
use crate::{IndexError, Result};

/// Rows of one chunk, in key order.
type ChunkRows = Vec<(PrimaryKey, SqlValue)>;

/// Per-bucket contribution of one chunk: occurrences and the keys seen.
type Contributions = BTreeMap<BucketKey, (i64, Vec<PrimaryKey>)>;

/// `FROM ... WHERE ... ORDER BY ... LIMIT` shared by the row and aggregate queries.
fn chunk_source(table: &str, key: &KeyColumns, resume: bool, limit_param: usize) -> String {
    let filter = if resume {
        format!(" WHERE {}", key.compare_predicate(">", 1))
    } else {
        String::new()
    };
    format!(
        "FROM {table}{filter} ORDER BY {keys} LIMIT ?{limit}",
        table = quote_ident(table),
        filter = filter,
        keys = key.select_list(),
        limit = limit_param
    )
}

fn read_chunk(
    conn: &Connection,
    cursor: &Cursor,
    key: &KeyColumns,
    chunk_size: usize,
) -> Result<ChunkRows> {
    let mut args: Vec<SqlValue> = cursor
        .last_key
        .as_ref()
        .map(|k| k.values().to_vec())
        .unwrap_or_default();
    let limit_param = args.len() + 1;
    args.push(SqlValue::Integer(chunk_size as i64));

    let sql = format!(
        "SELECT {keys}, {column} {source}",
        keys = key.select_list(),
        column = quote_ident(&cursor.column),
        source = chunk_source(&cursor.table, key, cursor.last_key.is_some(), limit_param)
    );

    let width = key.len();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), |row| {
            let pk = (0..width)
                .map(|i| row.get::<_, SqlValue>(i))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((PrimaryKey(pk), row.get::<_, SqlValue>(width)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn summarize_chunk(
    conn: &Connection,
    cursor: &Cursor,
    key: &KeyColumns,
    config: &IndexerConfig,
) -> Result<StatsDelta> {
    let mut args: Vec<SqlValue> = cursor
        .last_key
        .as_ref()
        .map(|k| k.values().to_vec())
        .unwrap_or_default();
    let limit_param = args.len() + 1;
    let max_len_param = args.len() + 2;
    args.push(SqlValue::Integer(config.chunk_size as i64));
    args.push(SqlValue::Integer(config.max_value_length as i64));

    // CASE keeps json_type() away from texts json_valid() rejected
    let sql = format!(
        "WITH chunk AS (SELECT {column} AS value {source})
SELECT
  count(*),
  count(*) FILTER (WHERE typeof(value) = 'null'),
  count(*) FILTER (WHERE typeof(value) = 'integer'),
  count(*) FILTER (WHERE typeof(value) = 'real'),
  count(*) FILTER (WHERE typeof(value) = 'text'),
  count(*) FILTER (WHERE typeof(value) = 'blob'),
  count(*) FILTER (WHERE CASE WHEN typeof(value) = 'text' AND json_valid(value) THEN json_type(value) END = 'text'),
  count(*) FILTER (WHERE CASE WHEN typeof(value) = 'text' AND json_valid(value) THEN json_type(value) END = 'array'),
  count(*) FILTER (WHERE CASE WHEN typeof(value) = 'text' AND json_valid(value) THEN json_type(value) END = 'object'),
  count(*) FILTER (WHERE typeof(value) = 'text' AND instr(value, ' ') > 0),
  count(*) FILTER (WHERE typeof(value) = 'text' AND instr(value, char(10)) > 0),
  min(CASE WHEN typeof(value) = 'blob' OR (typeof(value) = 'text' AND length(value) > ?{max_len}) THEN NULL ELSE value END),
  max(CASE WHEN typeof(value) = 'blob' OR (typeof(value) = 'text' AND length(value) > ?{max_len}) THEN NULL ELSE value END),
  min(length(value)) FILTER (WHERE typeof(value) = 'text'),
  max(length(value)) FILTER (WHERE typeof(value) = 'text'),
  min(length(value)) FILTER (WHERE typeof(value) = 'blob'),
  max(length(value)) FILTER (WHERE typeof(value) = 'blob')
FROM chunk",
        column = quote_ident(&cursor.column),
        source = chunk_source(&cursor.table, key, cursor.last_key.is_some(), limit_param),
        max_len = max_len_param,
    );

    let delta = conn.query_row(&sql, params_from_iter(args.iter()), |row| {
        Ok(StatsDelta {
            count: row.get(0)?,
            nulls: row.get(1)?,
            integers: row.get(2)?,
            reals: row.get(3)?,
            texts: row.get(4)?,
            blobs: row.get(5)?,
            json_strings: row.get(6)?,
            json_arrays: row.get(7)?,
            json_objects: row.get(8)?,
            texts_whitespace: row.get(9)?,
            texts_newline: row.get(10)?,
            min: row.get(11)?,
            max: row.get(12)?,
            texts_min_length: row.get(13)?,
            texts_max_length: row.get(14)?,
            blobs_min_length: row.get(15)?,
            blobs_max_length: row.get(16)?,
        })
    })?;
    Ok(delta)
}

/// Distinct-value contributions of a chunk: one pass over scalar texts, one
/// flattening texts that hold JSON arrays.
fn distinct_contributions(rows: &ChunkRows, config: &IndexerConfig) -> Contributions {
    let mut out = Contributions::new();
    let mut add = |term: &str, pk: &PrimaryKey| {
        let entry = out
            .entry(BucketKey::new(term, config.key_length))
            .or_insert_with(|| (0, Vec::new()));
        entry.0 += 1;
        entry.1.push(pk.clone());
    };

    for (pk, value) in rows {
        if let Some(term) = value.as_text().and_then(|s| scalar_term(s, config.max_value_length)) {
            add(term, pk);
        }
    }

    for (pk, value) in rows {
        if let Some(s) = value.as_text() {
            for term in array_terms(s, config.max_value_length) {
                add(&term, pk);
            }
        }
    }

    out
}

/// Scan the next chunk of the least recently advanced pending column.
///
/// Returns `false` when no column has backfill work left.
pub fn index_next_backfill_batch(conn: &mut Connection, config: &IndexerConfig) -> Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some(cursor) = next_pending_cursor(&tx)? else {
        return Ok(false);
    };

    let table = describe_table(&tx, &cursor.table)?
        .ok_or_else(|| IndexError::TableNotFound(cursor.table.clone()))?;

    let rows = read_chunk(&tx, &cursor, &table.key, config.chunk_size)?;
    let summary = summarize_chunk(&tx, &cursor, &table.key, config)?;
    apply_delta(&tx, cursor.table_id, cursor.column_id, &summary)?;

    for (bucket_key, (count, pks)) in distinct_contributions(&rows, config) {
        let mut bucket = load_bucket(&tx, cursor.table_id, cursor.column_id, &bucket_key)?
            .unwrap_or_default();
        bucket.merge(count, &pks, config.max_samples);
        save_bucket(&tx, cursor.table_id, cursor.column_id, &bucket_key, &bucket)?;
    }

    let still_pending = rows.len() >= config.chunk_size;
    let last_key = rows.last().map(|(pk, _)| pk);
    advance_cursor(&tx, cursor.table_id, cursor.column_id, last_key, still_pending)?;

    tx.commit()?;

    tracing::debug!(
        "Backfilled {} rows of {}.{}",
        rows.len(),
        cursor.table,
        cursor.column
    );
    if !still_pending {
        tracing::info!("Finished backfill of {}.{}", cursor.table, cursor.column);
    }

    Ok(true)
}
