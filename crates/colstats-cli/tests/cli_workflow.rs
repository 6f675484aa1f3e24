#![allow(deprecated)] // cargo_bin is deprecated in assert_cmd but replacement not yet stable

use assert_cmd::Command;
use predicates::str::contains;
use rusqlite::Connection;
use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

type TestResult<T = ()> = std::result::Result<T, Box<dyn Error>>;

/// A throwaway directory holding one SQLite database for exercising the CLI.
struct SampleDatabase {
    dir: TempDir,
}

impl SampleDatabase {
    fn new() -> TestResult<Self> {
        let sample = Self {
            dir: TempDir::new()?,
        };
        let conn = Connection::open(sample.db_path())?;
        conn.execute_batch(
            "CREATE TABLE fruit(id integer primary key, name text, tags text);
             INSERT INTO fruit(name, tags) VALUES ('Apple', '[\"red\"]');
             INSERT INTO fruit(name, tags) VALUES ('Apricot', '[\"orange\"]');
             INSERT INTO fruit(name, tags) VALUES ('Apricot', NULL);
             INSERT INTO fruit(name, tags) VALUES ('Banana', '[\"yellow\"]');",
        )?;
        Ok(sample)
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn db_path(&self) -> PathBuf {
        self.root().join("fruit.db")
    }

    fn db_arg(&self) -> String {
        self.db_path().display().to_string()
    }

    fn colstats(&self) -> TestResult<Command> {
        let mut cmd = Command::cargo_bin("colstats")?;
        cmd.current_dir(self.root());
        Ok(cmd)
    }

    fn index(&self) -> TestResult {
        self.colstats()?
            .args(["index", &self.db_arg()])
            .assert()
            .success();
        Ok(())
    }

    fn table_count(&self, pattern: &str) -> TestResult<i64> {
        let conn = Connection::open(self.db_path())?;
        Ok(conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE name LIKE ?1",
            [pattern],
            |r| r.get(0),
        )?)
    }
}

#[test]
fn index_reports_progress_as_json() -> TestResult {
    let sample = SampleDatabase::new()?;

    let output = sample
        .colstats()?
        .args(["index", &sample.db_arg()])
        .output()?;
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report[0]["columns_indexed"], 3);
    assert_eq!(report[0]["changes_applied"], 0);
    assert!(sample.table_count("colstats_%")? > 0);
    Ok(())
}

#[test]
fn suggest_returns_most_frequent_first() -> TestResult {
    let sample = SampleDatabase::new()?;
    sample.index()?;

    sample
        .colstats()?
        .args(["suggest", &sample.db_arg(), "fruit", "name", "ap", "--format", "text"])
        .assert()
        .success()
        .stdout(contains("2\tApricot\n1\tApple"));

    sample
        .colstats()?
        .args(["suggest", &sample.db_arg(), "fruit", "tags", "ora"])
        .assert()
        .success()
        .stdout(contains("\"value\":\"orange\""));
    Ok(())
}

#[test]
fn suggest_without_matches_exits_not_found() -> TestResult {
    let sample = SampleDatabase::new()?;
    sample.index()?;

    sample
        .colstats()?
        .args(["suggest", &sample.db_arg(), "fruit", "name", "zzz"])
        .assert()
        .code(1)
        .stdout(contains("[]"));
    Ok(())
}

#[test]
fn stats_show_counts_after_live_writes() -> TestResult {
    let sample = SampleDatabase::new()?;
    sample.index()?;

    // Goes through the capture trigger, applied by the next index run
    let conn = Connection::open(sample.db_path())?;
    conn.execute("INSERT INTO fruit(name, tags) VALUES ('Cherry', x'00')", [])?;
    drop(conn);
    sample.index()?;

    let output = sample
        .colstats()?
        .args(["stats", &sample.db_arg(), "fruit", "--column", "tags"])
        .output()?;
    assert!(output.status.success());

    let stats: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(stats[0]["column"], "tags");
    assert_eq!(stats[0]["count"], 5);
    assert_eq!(stats[0]["json_arrays"], 3);
    assert_eq!(stats[0]["blobs"], 1);
    assert_eq!(stats[0]["nulls"], 1);

    sample
        .colstats()?
        .args(["stats", &sample.db_arg(), "fruit", "--format", "text"])
        .assert()
        .success()
        .stdout(contains("name (text)"))
        .stdout(contains("count: 5"));
    Ok(())
}

#[test]
fn stats_before_index_exits_not_found() -> TestResult {
    let sample = SampleDatabase::new()?;

    sample
        .colstats()?
        .args(["stats", &sample.db_arg(), "fruit", "--format", "text"])
        .assert()
        .code(1)
        .stderr(contains("colstats index"));
    Ok(())
}

#[test]
fn missing_database_exits_not_found() -> TestResult {
    let sample = SampleDatabase::new()?;

    sample
        .colstats()?
        .args(["index", "nope.db"])
        .assert()
        .code(1)
        .stdout(contains("Database not found"));
    Ok(())
}

#[test]
fn uninstall_removes_tables_and_triggers() -> TestResult {
    let sample = SampleDatabase::new()?;
    sample.index()?;

    sample
        .colstats()?
        .args(["uninstall", &sample.db_arg(), "--format", "text"])
        .assert()
        .success()
        .stdout(contains("Removed colstats"));

    assert_eq!(sample.table_count("colstats_%")?, 0);

    // Writes still work once the triggers are gone
    let conn = Connection::open(sample.db_path())?;
    conn.execute("INSERT INTO fruit(name) VALUES ('Date')", [])?;
    Ok(())
}

#[test]
fn config_file_is_honoured() -> TestResult {
    let sample = SampleDatabase::new()?;
    fs::write(sample.root().join(".colstats.toml"), "chunk_size = 1\n")?;

    let output = sample
        .colstats()?
        .args(["index", &sample.db_arg()])
        .output()?;
    assert!(output.status.success());

    // Four rows in chunks of one: five chunks per column, three columns
    let report: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report[0]["batches_scanned"], 15);
    Ok(())
}
