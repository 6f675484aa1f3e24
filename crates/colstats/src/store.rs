//! Stats Store access.
//!
//! The backfill scanner and the change applier are the only writers of the
//! column stats, cursor and bucket tables; everything here is meant to run
//! inside the caller's transaction. Foreground code only uses the read
//! functions at the bottom.

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use crate::catalog::indexable_schema;
use crate::config::IndexerConfig;
use crate::ids::{intern, lookup};
use crate::value::{json_kind, BucketKey, JsonKind, PrimaryKey, SqlValue};
use crate::Result;

// ============================================================================
// Aggregate deltas
// ============================================================================

/// A signed change to one column's aggregate row.
///
/// Counters are added as-is. `min`/`max` and the length bounds only ever
/// widen the stored values; `None` leaves them untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsDelta {
    pub count: i64,
    pub nulls: i64,
    pub integers: i64,
    pub reals: i64,
    pub texts: i64,
    pub blobs: i64,
    pub json_strings: i64,
    pub json_arrays: i64,
    pub json_objects: i64,
    pub texts_whitespace: i64,
    pub texts_newline: i64,
    pub min: Option<SqlValue>,
    pub max: Option<SqlValue>,
    pub texts_min_length: Option<i64>,
    pub texts_max_length: Option<i64>,
    pub blobs_min_length: Option<i64>,
    pub blobs_max_length: Option<i64>,
}

impl StatsDelta {
    /// Delta for one value being inserted (`sign = 1`) or deleted (`sign = -1`).
    ///
    /// Deletes never narrow min/max or length bounds; exact narrowing would
    /// need a rescan.
    pub fn for_value(value: &SqlValue, sign: i64, config: &IndexerConfig) -> Self {
        let widen = sign > 0;
        let mut delta = StatsDelta {
            count: sign,
            ..Default::default()
        };

        match value {
            SqlValue::Null => delta.nulls = sign,
            SqlValue::Integer(_) => delta.integers = sign,
            SqlValue::Real(_) => delta.reals = sign,
            SqlValue::Text(s) => {
                delta.texts = sign;
                if s.contains(' ') {
                    delta.texts_whitespace = sign;
                }
                if s.contains('\n') {
                    delta.texts_newline = sign;
                }
                match json_kind(s) {
                    Some(JsonKind::String) => delta.json_strings = sign,
                    Some(JsonKind::Array) => delta.json_arrays = sign,
                    Some(JsonKind::Object) => delta.json_objects = sign,
                    Some(JsonKind::Other) | None => {}
                }
                if widen {
                    let len = s.chars().count() as i64;
                    delta.texts_min_length = Some(len);
                    delta.texts_max_length = Some(len);
                }
            }
            SqlValue::Blob(b) => {
                delta.blobs = sign;
                if widen {
                    delta.blobs_min_length = Some(b.len() as i64);
                    delta.blobs_max_length = Some(b.len() as i64);
                }
            }
        }

        if widen && value.is_min_max_candidate(config.max_value_length) {
            delta.min = Some(value.clone());
            delta.max = Some(value.clone());
        }

        delta
    }
}

/// Merge a delta into a column's aggregate row. Returns rows touched (0 if
/// the column is not tracked).
pub fn apply_delta(conn: &Connection, table_id: i64, column_id: i64, d: &StatsDelta) -> Result<usize> {
    let n = conn.execute(
        "UPDATE colstats_column_stats SET
           count = count + ?3,
           nulls = nulls + ?4,
           integers = integers + ?5,
           reals = reals + ?6,
           texts = texts + ?7,
           blobs = blobs + ?8,
           json_strings = json_strings + ?9,
           json_arrays = json_arrays + ?10,
           json_objects = json_objects + ?11,
           texts_whitespace = texts_whitespace + ?12,
           texts_newline = texts_newline + ?13,
           \"min\" = coalesce(min(\"min\", ?14), ?14, \"min\"),
           \"max\" = coalesce(max(\"max\", ?15), ?15, \"max\"),
           texts_min_length = coalesce(min(texts_min_length, ?16), ?16, texts_min_length),
           texts_max_length = coalesce(max(texts_max_length, ?17), ?17, texts_max_length),
           blobs_min_length = coalesce(min(blobs_min_length, ?18), ?18, blobs_min_length),
           blobs_max_length = coalesce(max(blobs_max_length, ?19), ?19, blobs_max_length)
         WHERE table_id = ?1 AND column_id = ?2",
        params![
            table_id,
            column_id,
            d.count,
            d.nulls,
            d.integers,
            d.reals,
            d.texts,
            d.blobs,
            d.json_strings,
            d.json_arrays,
            d.json_objects,
            d.texts_whitespace,
            d.texts_newline,
            d.min,
            d.max,
            d.texts_min_length,
            d.texts_max_length,
            d.blobs_min_length,
            d.blobs_max_length,
        ],
    )?;
    Ok(n)
}

// ============================================================================
// Backfill cursors
// ============================================================================

/// Backfill progress for one column.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub table_id: i64,
    pub column_id: i64,
    pub table: String,
    pub column: String,
    /// Key of the last row scanned; `None` before the first chunk.
    pub last_key: Option<PrimaryKey>,
}

/// What [`ensure_cursors`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorReport {
    pub provisioned: usize,
    pub retired: usize,
}

/// Provision stats rows and cursors for every indexable column, and retire
/// the ones whose column has disappeared.
pub fn ensure_cursors(conn: &mut Connection) -> Result<CursorReport> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut report = CursorReport::default();
    let mut live = HashSet::new();

    for table in indexable_schema(&tx)? {
        let table_id = intern(&tx, &table.name)?;
        for column in &table.columns {
            let column_id = intern(&tx, &column.name)?;
            live.insert((table_id, column_id));

            tx.execute(
                "INSERT OR IGNORE INTO colstats_column_stats(table_id, column_id, type, nullable, pk)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![table_id, column_id, column.decl_type, column.nullable, column.pk],
            )?;
            report.provisioned += tx.execute(
                "INSERT OR IGNORE INTO colstats_column_stats_ops(table_id, column_id, pending)
                 VALUES (?1, ?2, 1)",
                params![table_id, column_id],
            )?;
        }
    }

    let tracked: Vec<(i64, i64)> = {
        let mut stmt = tx.prepare(
            "SELECT table_id, column_id FROM colstats_column_stats_ops
             UNION SELECT table_id, column_id FROM colstats_column_stats",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    for (table_id, column_id) in tracked {
        if live.contains(&(table_id, column_id)) {
            continue;
        }
        for table in [
            "colstats_column_stats_values",
            "colstats_column_stats_ops",
            "colstats_column_stats",
        ] {
            tx.execute(
                &format!("DELETE FROM {} WHERE table_id = ?1 AND column_id = ?2", table),
                params![table_id, column_id],
            )?;
        }
        report.retired += 1;
    }

    tx.commit()?;

    if report.provisioned > 0 || report.retired > 0 {
        tracing::info!(
            "Cursors: {} provisioned, {} retired",
            report.provisioned,
            report.retired
        );
    }
    Ok(report)
}

/// The pending cursor that was advanced least recently.
pub fn next_pending_cursor(conn: &Connection) -> Result<Option<Cursor>> {
    let row = conn
        .query_row(
            "SELECT o.table_id, o.column_id, t.name, c.name, o.last_key
             FROM colstats_column_stats_ops o
             JOIN colstats_ids t ON t.id = o.table_id
             JOIN colstats_ids c ON c.id = o.column_id
             WHERE o.pending = 1
             ORDER BY o.updated_at, o.table_id, o.column_id
             LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((table_id, column_id, table, column, last_key)) = row else {
        return Ok(None);
    };

    let last_key = match last_key {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };

    Ok(Some(Cursor {
        table_id,
        column_id,
        table,
        column,
        last_key,
    }))
}

/// Persist a cursor position and whether the column still has rows to scan.
pub fn advance_cursor(
    conn: &Connection,
    table_id: i64,
    column_id: i64,
    last_key: Option<&PrimaryKey>,
    pending: bool,
) -> Result<()> {
    let last_key = last_key.map(serde_json::to_string).transpose()?;
    conn.execute(
        "UPDATE colstats_column_stats_ops
         SET last_key = coalesce(?3, last_key),
             pending = ?4,
             updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
         WHERE table_id = ?1 AND column_id = ?2",
        params![table_id, column_id, last_key, pending],
    )?;
    Ok(())
}

/// Number of columns still waiting for backfill.
pub fn pending_columns(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT count(*) FROM colstats_column_stats_ops WHERE pending = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

// ============================================================================
// Distinct-value buckets
// ============================================================================

/// Occurrence count and sampled row keys for one bucket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bucket {
    pub count: i64,
    pub pks: Vec<PrimaryKey>,
}

pub fn load_bucket(
    conn: &Connection,
    table_id: i64,
    column_id: i64,
    key: &BucketKey,
) -> Result<Option<Bucket>> {
    let row = conn
        .query_row(
            "SELECT count, pks FROM colstats_column_stats_values
             WHERE table_id = ?1 AND column_id = ?2 AND value = ?3 AND hash = ?4",
            params![table_id, column_id, key.value, key.hash],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    match row {
        Some((count, pks)) => Ok(Some(Bucket {
            count,
            pks: serde_json::from_str(&pks)?,
        })),
        None => Ok(None),
    }
}

/// Write a bucket back, deleting it once its count reaches zero.
pub fn save_bucket(
    conn: &Connection,
    table_id: i64,
    column_id: i64,
    key: &BucketKey,
    bucket: &Bucket,
) -> Result<()> {
    if bucket.count <= 0 {
        conn.execute(
            "DELETE FROM colstats_column_stats_values
             WHERE table_id = ?1 AND column_id = ?2 AND value = ?3 AND hash = ?4",
            params![table_id, column_id, key.value, key.hash],
        )?;
        return Ok(());
    }

    conn.execute(
        "INSERT OR REPLACE INTO colstats_column_stats_values(table_id, column_id, value, hash, count, pks)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            table_id,
            column_id,
            key.value,
            key.hash,
            bucket.count,
            serde_json::to_string(&bucket.pks)?,
        ],
    )?;
    Ok(())
}

impl Bucket {
    /// Fold in a chunk's contribution: existing samples are kept, then the
    /// newest chunk keys fill remaining slots.
    pub fn merge(&mut self, count: i64, chunk_pks: &[PrimaryKey], max_samples: usize) {
        self.count += count;
        for pk in chunk_pks.iter().rev() {
            if self.pks.len() >= max_samples {
                break;
            }
            if !self.pks.contains(pk) {
                self.pks.push(pk.clone());
            }
        }
    }

    /// Record one more occurrence at `pk`.
    ///
    /// A full sample set is left alone, so a later [`Bucket::remove`] of the
    /// same key restores it exactly.
    pub fn add(&mut self, pk: &PrimaryKey, max_samples: usize) {
        self.count += 1;
        if self.pks.len() < max_samples && !self.pks.contains(pk) {
            self.pks.push(pk.clone());
        }
    }

    /// Remove one occurrence at `pk`.
    pub fn remove(&mut self, pk: &PrimaryKey) {
        self.count -= 1;
        self.pks.retain(|p| p != pk);
    }
}

// ============================================================================
// Reads
// ============================================================================

/// Aggregate statistics for one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    pub table: String,
    pub column: String,
    #[serde(rename = "type")]
    pub decl_type: String,
    pub nullable: bool,
    pub pk: bool,
    /// Still being backfilled; counters are partial.
    pub pending: bool,
    pub min: Option<SqlValue>,
    pub max: Option<SqlValue>,
    pub count: i64,
    pub nulls: i64,
    pub integers: i64,
    pub reals: i64,
    pub texts: i64,
    pub blobs: i64,
    pub json_strings: i64,
    pub json_arrays: i64,
    pub json_objects: i64,
    pub texts_min_length: Option<i64>,
    pub texts_max_length: Option<i64>,
    pub texts_whitespace: i64,
    pub texts_newline: i64,
    pub blobs_min_length: Option<i64>,
    pub blobs_max_length: Option<i64>,
}

const STATS_SELECT: &str = "SELECT t.name, c.name, s.type, s.nullable, s.pk, coalesce(o.pending, 0),
       s.\"min\", s.\"max\", s.count, s.nulls, s.integers, s.reals, s.texts, s.blobs,
       s.json_strings, s.json_arrays, s.json_objects,
       s.texts_min_length, s.texts_max_length, s.texts_whitespace, s.texts_newline,
       s.blobs_min_length, s.blobs_max_length
FROM colstats_column_stats s
JOIN colstats_ids t ON t.id = s.table_id
JOIN colstats_ids c ON c.id = s.column_id
LEFT JOIN colstats_column_stats_ops o ON o.table_id = s.table_id AND o.column_id = s.column_id";

fn row_to_stats(row: &rusqlite::Row<'_>) -> rusqlite::Result<ColumnStats> {
    Ok(ColumnStats {
        table: row.get(0)?,
        column: row.get(1)?,
        decl_type: row.get(2)?,
        nullable: row.get(3)?,
        pk: row.get(4)?,
        pending: row.get(5)?,
        min: row.get(6)?,
        max: row.get(7)?,
        count: row.get(8)?,
        nulls: row.get(9)?,
        integers: row.get(10)?,
        reals: row.get(11)?,
        texts: row.get(12)?,
        blobs: row.get(13)?,
        json_strings: row.get(14)?,
        json_arrays: row.get(15)?,
        json_objects: row.get(16)?,
        texts_min_length: row.get(17)?,
        texts_max_length: row.get(18)?,
        texts_whitespace: row.get(19)?,
        texts_newline: row.get(20)?,
        blobs_min_length: row.get(21)?,
        blobs_max_length: row.get(22)?,
    })
}

/// Statistics for one column, if it is tracked.
pub fn column_stats(conn: &Connection, table: &str, column: &str) -> Result<Option<ColumnStats>> {
    let (Some(table_id), Some(column_id)) = (lookup(conn, table)?, lookup(conn, column)?) else {
        return Ok(None);
    };
    let stats = conn
        .query_row(
            &format!("{} WHERE s.table_id = ?1 AND s.column_id = ?2", STATS_SELECT),
            params![table_id, column_id],
            row_to_stats,
        )
        .optional()?;
    Ok(stats)
}

/// Statistics for every tracked column of a table, ordered by column name.
pub fn table_stats(conn: &Connection, table: &str) -> Result<Vec<ColumnStats>> {
    let Some(table_id) = lookup(conn, table)? else {
        return Ok(Vec::new());
    };
    let mut stmt = conn.prepare(&format!(
        "{} WHERE s.table_id = ?1 ORDER BY c.name",
        STATS_SELECT
    ))?;
    let stats = stmt
        .query_map(params![table_id], row_to_stats)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(stats)
}
