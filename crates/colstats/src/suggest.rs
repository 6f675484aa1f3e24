//! Autosuggest over the distinct-value index.
//!
//! Buckets only hold a lowercased, truncated key plus a hash, so the value
//! shown to the user is recovered by re-reading one of the bucket's sample
//! rows and picking the text (or JSON array element) whose hash matches.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;

use crate::catalog::{describe_table, SourceTable};
use crate::config::IndexerConfig;
use crate::db::quote_ident;
use crate::ids::lookup;
use crate::value::{array_terms, content_hash, scalar_term, truncate_key, PrimaryKey, SqlValue};
use crate::Result;

/// Sorts after every character a key can hold.
const KEY_CEILING: char = '\u{10FFFF}';

/// One suggested value with its frequency and sample rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub value: String,
    pub count: i64,
    pub pks: Vec<PrimaryKey>,
}

struct Candidate {
    key: String,
    hash: String,
    count: i64,
    pks: Vec<PrimaryKey>,
}

fn candidates(
    conn: &Connection,
    table_id: i64,
    column_id: i64,
    lo: &str,
    limit: usize,
) -> Result<Vec<Candidate>> {
    let hi = format!("{}{}", lo, KEY_CEILING);
    let mut stmt = conn.prepare(
        "SELECT value, hash, count, pks FROM colstats_column_stats_values
         WHERE table_id = ?1 AND column_id = ?2 AND value >= ?3 AND value < ?4
         ORDER BY value, hash
         LIMIT ?5",
    )?;
    let rows = stmt
        .query_map(
            params![table_id, column_id, lo, hi, limit as i64],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(key, hash, count, pks)| -> Result<Candidate> {
            Ok(Candidate {
                key,
                hash,
                count,
                pks: serde_json::from_str(&pks)?,
            })
        })
        .collect()
}

/// Read the current value of `column` in the row identified by `pk`.
fn read_cell(
    conn: &Connection,
    table: &SourceTable,
    column: &str,
    pk: &PrimaryKey,
) -> Result<Option<SqlValue>> {
    if pk.values().len() != table.key.len() {
        return Ok(None);
    }
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        quote_ident(column),
        quote_ident(&table.name),
        table.key.compare_predicate("=", 1)
    );
    let value = conn
        .query_row(&sql, params_from_iter(pk.values().iter()), |row| row.get(0))
        .optional()?;
    Ok(value)
}

/// The full text behind a bucket, found in one of its sample rows.
fn resolve(
    conn: &Connection,
    table: &SourceTable,
    column: &str,
    candidate: &Candidate,
    config: &IndexerConfig,
) -> Result<Option<String>> {
    for pk in &candidate.pks {
        let Some(SqlValue::Text(text)) = read_cell(conn, table, column, pk)? else {
            continue;
        };
        if let Some(term) = scalar_term(&text, config.max_value_length) {
            if content_hash(term) == candidate.hash {
                return Ok(Some(term.to_string()));
            }
        }
        if let Some(element) = array_terms(&text, config.max_value_length)
            .into_iter()
            .find(|e| content_hash(e) == candidate.hash)
        {
            return Ok(Some(element));
        }
    }
    Ok(None)
}

/// Most frequent values of `table.column` starting with `prefix`
/// (case-insensitive).
///
/// Buckets whose sample rows are all gone or changed are skipped, and the
/// next bucket by count takes their place, so a result can include values
/// ranked below the first `suggest_limit` buckets. Unknown tables and
/// columns yield an empty list.
pub fn autosuggest(
    conn: &Connection,
    table: &str,
    column: &str,
    prefix: &str,
    config: &IndexerConfig,
) -> Result<Vec<Suggestion>> {
    let (Some(table_id), Some(column_id)) = (lookup(conn, table)?, lookup(conn, column)?) else {
        return Ok(Vec::new());
    };
    let Some(source) = describe_table(conn, table)? else {
        return Ok(Vec::new());
    };

    let lo = truncate_key(prefix, config.key_length);
    let needle = prefix.to_lowercase();

    let mut found = candidates(conn, table_id, column_id, &lo, config.suggest_candidates)?;
    found.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));

    let mut suggestions = Vec::new();
    for candidate in found {
        if suggestions.len() >= config.suggest_limit {
            break;
        }
        let Some(value) = resolve(conn, &source, column, &candidate, config)? else {
            tracing::debug!(
                "No live sample for bucket {:?} in {}.{}",
                candidate.key,
                table,
                column
            );
            continue;
        };
        // Keys are truncated, so longer prefixes need a check on the full value
        if !value.to_lowercase().starts_with(&needle) {
            continue;
        }
        suggestions.push(Suggestion {
            value,
            count: candidate.count,
            pks: candidate.pks,
        });
    }

    Ok(suggestions)
}
