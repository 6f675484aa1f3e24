//! End-to-end indexing against database files on disk.

use colstats::backfill::index_next_backfill_batch;
use colstats::scheduler::{prepare_database, step, StepOutcome};
use colstats::store::{column_stats, pending_columns, table_stats};
use colstats::value::BucketKey;
use colstats::{autosuggest, reindex, ColumnStats, Database, IndexerConfig, SqlValue, SqliteDatabase};
use rusqlite::Connection;
use std::error::Error;
use std::path::PathBuf;
use tempfile::TempDir;

type TestResult<T = ()> = std::result::Result<T, Box<dyn Error>>;

/// A throwaway SQLite file seeded with a schema and rows.
struct SampleDatabase {
    dir: TempDir,
}

impl SampleDatabase {
    fn new(seed_sql: &str) -> TestResult<Self> {
        let dir = TempDir::new()?;
        let conn = Connection::open(dir.path().join("sample.db"))?;
        conn.execute_batch(seed_sql)?;
        Ok(Self { dir })
    }

    fn path(&self) -> PathBuf {
        self.dir.path().join("sample.db")
    }

    fn open(&self) -> TestResult<SqliteDatabase> {
        Ok(SqliteDatabase::open(&self.path())?)
    }
}

fn stats(db: &SqliteDatabase, table: &str, column: &str) -> TestResult<ColumnStats> {
    let found = db.with_connection(|conn| column_stats(conn, table, column))?;
    Ok(found.ok_or_else(|| format!("no stats for {}.{}", table, column))?)
}

fn numbered_rows(n: usize) -> String {
    let mut sql = String::from("CREATE TABLE items(id integer primary key, name text, score real);");
    for i in 1..=n {
        sql.push_str(&format!(
            "INSERT INTO items VALUES ({}, 'name {}', {}.5);",
            i,
            i % 7,
            i
        ));
    }
    sql
}

fn scenario_sql() -> &'static str {
    "CREATE TABLE data(id integer primary key, title text, json text, age integer, blobby blob, ratio real);
     INSERT INTO data VALUES (1, 'title1', '[\"foo\"]', 23, NULL, 0.43);
     INSERT INTO data VALUES (2, 'title2', 'not json', NULL, NULL, NULL);"
}

#[test]
fn counts_match_row_count_exactly_once() -> TestResult {
    let sample = SampleDatabase::new(&numbered_rows(57))?;
    let db = sample.open()?;
    let config = IndexerConfig {
        chunk_size: 8,
        ..Default::default()
    };

    reindex(&db, &config)?;

    for column in ["id", "name", "score"] {
        let s = stats(&db, "items", column)?;
        assert_eq!(s.count, 57, "count for {}", column);
        assert!(!s.pending);
    }
    assert_eq!(stats(&db, "items", "score")?.reals, 57);
    Ok(())
}

#[test]
fn backfill_resumes_across_restarts() -> TestResult {
    let sample = SampleDatabase::new(&numbered_rows(40))?;
    let config = IndexerConfig {
        chunk_size: 6,
        ..Default::default()
    };

    // Uninterrupted run for reference
    let reference = SampleDatabase::new(&numbered_rows(40))?;
    let reference_db = reference.open()?;
    reindex(&reference_db, &config)?;
    let expected = reference_db.with_connection(|conn| table_stats(conn, "items"))?;

    // Interrupted run: a few chunks, close, reopen, finish
    {
        let db = sample.open()?;
        prepare_database(&db)?;
        for _ in 0..5 {
            assert_eq!(step(&db, &config)?, StepOutcome::Backfilled);
        }
        assert!(db.with_connection(|conn| pending_columns(conn))? > 0);
    }

    let db = sample.open()?;
    reindex(&db, &config)?;
    let actual = db.with_connection(|conn| table_stats(conn, "items"))?;
    assert_eq!(actual, expected);
    Ok(())
}

#[test]
fn backfill_is_idempotent_once_complete() -> TestResult {
    let sample = SampleDatabase::new(&numbered_rows(12))?;
    let db = sample.open()?;
    let config = IndexerConfig::default();

    reindex(&db, &config)?;
    let before = db.with_connection(|conn| table_stats(conn, "items"))?;

    let worked = db.with_connection(|conn| index_next_backfill_batch(conn, &config))?;
    assert!(!worked);
    let report = reindex(&db, &config)?;
    assert_eq!(report.batches_scanned, 0);

    let after = db.with_connection(|conn| table_stats(conn, "items"))?;
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn colliding_prefixes_get_separate_buckets() -> TestResult {
    let sample = SampleDatabase::new(
        "CREATE TABLE docs(id integer primary key, title text);
         INSERT INTO docs(title) VALUES ('Quarterly planning notes for marketing');
         INSERT INTO docs(title) VALUES ('Quarterly planning notes for engineering');
         INSERT INTO docs(title) VALUES ('Quarterly planning notes for engineering');",
    )?;
    let db = sample.open()?;
    let config = IndexerConfig::default();
    reindex(&db, &config)?;

    let marketing = BucketKey::new("Quarterly planning notes for marketing", config.key_length);
    let engineering = BucketKey::new("Quarterly planning notes for engineering", config.key_length);
    assert_eq!(marketing.value, engineering.value);
    assert_ne!(marketing.hash, engineering.hash);

    let buckets: i64 = db.with_connection(|conn| {
        Ok(conn.query_row(
            "SELECT count(*) FROM colstats_column_stats_values WHERE value = ?1",
            [&marketing.value],
            |r| r.get(0),
        )?)
    })?;
    assert_eq!(buckets, 2);

    let found = db.with_connection(|conn| autosuggest(conn, "docs", "title", "quarterly", &config))?;
    let values: Vec<(&str, i64)> = found.iter().map(|s| (s.value.as_str(), s.count)).collect();
    assert_eq!(
        values,
        vec![
            ("Quarterly planning notes for engineering", 2),
            ("Quarterly planning notes for marketing", 1),
        ]
    );
    Ok(())
}

#[test]
fn autosuggest_orders_by_count() -> TestResult {
    let mut seed = String::from("CREATE TABLE fruit(id integer primary key, name text);");
    for (name, n) in [("Apple", 5), ("Apricot", 9), ("Banana", 3)] {
        for _ in 0..n {
            seed.push_str(&format!("INSERT INTO fruit(name) VALUES ('{}');", name));
        }
    }
    let sample = SampleDatabase::new(&seed)?;
    let db = sample.open()?;
    let config = IndexerConfig::default();
    reindex(&db, &config)?;

    let found = db.with_connection(|conn| autosuggest(conn, "fruit", "name", "Ap", &config))?;
    let values: Vec<&str> = found.iter().map(|s| s.value.as_str()).collect();
    assert_eq!(values, vec!["Apricot", "Apple"]);
    Ok(())
}

#[test]
fn scenario_json_arrays_and_live_blob_insert() -> TestResult {
    let sample = SampleDatabase::new(scenario_sql())?;
    let db = sample.open()?;
    let config = IndexerConfig::default();
    reindex(&db, &config)?;

    let json = stats(&db, "data", "json")?;
    assert_eq!(json.json_arrays, 1);
    assert_eq!(json.texts, 2);

    let blobby = stats(&db, "data", "blobby")?;
    assert_eq!(blobby.blobs, 0);
    assert_eq!(blobby.nulls, 2);

    let age = stats(&db, "data", "age")?;
    assert_eq!(age.min, Some(SqlValue::Integer(23)));
    assert_eq!(age.integers, 1);

    db.with_connection(|conn| {
        conn.execute(
            "INSERT INTO data VALUES (3, 'title3', '[]', 40, x'deadbeef', 1.5)",
            [],
        )?;
        Ok(())
    })?;
    let report = reindex(&db, &config)?;
    assert_eq!(report.changes_applied, 1);

    let blobby = stats(&db, "data", "blobby")?;
    assert_eq!(blobby.blobs, 1);
    assert_eq!(blobby.count, 3);
    assert_eq!(blobby.blobs_max_length, Some(4));

    let found = db.with_connection(|conn| autosuggest(conn, "data", "json", "fo", &config))?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].value, "foo");
    Ok(())
}

#[test]
fn schema_drift_rebuilds_from_scratch() -> TestResult {
    let sample = SampleDatabase::new(scenario_sql())?;
    let db = sample.open()?;
    reindex(&db, &IndexerConfig::default())?;

    // Simulate tables left behind by a different build
    db.with_connection(|conn| {
        conn.execute_batch(
            "DROP TABLE colstats_column_stats_values;
             CREATE TABLE colstats_column_stats_values(table_id, column_id, value);",
        )?;
        Ok(())
    })?;

    let report = reindex(&db, &IndexerConfig::default())?;
    assert!(report.batches_scanned > 0);
    assert_eq!(stats(&db, "data", "title")?.count, 2);
    Ok(())
}

#[test]
fn missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(SqliteDatabase::open(&dir.path().join("absent.db")).is_err());
}
