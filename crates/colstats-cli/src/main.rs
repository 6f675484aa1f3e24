//! colstats: column statistics and autosuggest for SQLite databases.
//!
//! This CLI provides offline access to the colstats indexer:
//! - Building or catching up the index (`index`)
//! - Running the background indexer until interrupted (`watch`)
//! - Querying column statistics and autosuggest
//! - Removing every trace of the indexer from a database

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colstats::schema::is_installed;
use colstats::store::{column_stats, table_stats};
use colstats::{
    autosuggest, reindex, uninstall, ColumnStats, Database, Engine, IndexerConfig, SqliteDatabase,
};

/// Exit codes for the CLI
///
/// - 0: Success
/// - 1: Not found (missing database, no index yet, or no results)
/// - 2: Error (invalid input, SQL failure, etc.)
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const NOT_FOUND: u8 = 1;
    pub const ERROR: u8 = 2;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

/// Incremental column statistics for SQLite databases
#[derive(Parser)]
#[command(name = "colstats")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log indexing progress to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding .colstats.toml (defaults to current directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or catch up the index: backfill every column, then apply queued changes
    Index {
        /// Database files to index
        #[arg(required = true)]
        databases: Vec<PathBuf>,
    },

    /// Keep the index up to date until interrupted with Ctrl+C
    Watch {
        /// Database files to watch
        #[arg(required = true)]
        databases: Vec<PathBuf>,
    },

    /// Suggest frequent values of a column starting with a prefix
    Suggest {
        /// Database file
        database: PathBuf,
        table: String,
        column: String,
        /// Case-insensitive prefix (may be empty)
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Show column statistics for a table
    Stats {
        /// Database file
        database: PathBuf,
        table: String,

        /// Only show this column
        #[arg(short, long)]
        column: Option<String>,
    },

    /// Drop every colstats trigger and table
    Uninstall {
        /// Database files to clean
        #[arg(required = true)]
        databases: Vec<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    let format = cli.format;
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            if format == OutputFormat::Json {
                let error_json = serde_json::json!({
                    "error": "CommandFailed",
                    "message": format!("{:#}", e),
                });
                eprintln!("{}", error_json);
            } else {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::from(exit_codes::ERROR)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let config = load_config(cli.config.as_deref())?;
    let (format, quiet) = (cli.format, cli.quiet);

    match cli.command {
        Commands::Index { databases } => cmd_index(&databases, &config, format, quiet),
        Commands::Watch { databases } => cmd_watch(&databases, config, format, quiet),
        Commands::Suggest {
            database,
            table,
            column,
            prefix,
        } => cmd_suggest(&database, &table, &column, &prefix, &config, format, quiet),
        Commands::Stats {
            database,
            table,
            column,
        } => cmd_stats(&database, &table, column.as_deref(), format, quiet),
        Commands::Uninstall { databases } => cmd_uninstall(&databases, format, quiet),
    }
}

fn load_config(dir: Option<&Path>) -> Result<IndexerConfig> {
    let dir = match dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    Ok(IndexerConfig::load(&dir))
}

/// Report a missing database or index in the requested format.
fn not_found(message: &str, format: OutputFormat) -> u8 {
    if format == OutputFormat::Json {
        println!("{}", serde_json::json!({ "error": message }));
    } else {
        eprintln!("{}", message);
    }
    exit_codes::NOT_FOUND
}

fn open_database(path: &Path) -> Result<Option<SqliteDatabase>> {
    if !path.exists() {
        return Ok(None);
    }
    let db = SqliteDatabase::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(Some(db))
}

/// Open every database, or report the first missing one.
fn open_all(paths: &[PathBuf]) -> Result<std::result::Result<Vec<SqliteDatabase>, String>> {
    let mut databases = Vec::with_capacity(paths.len());
    for path in paths {
        match open_database(path)? {
            Some(db) => databases.push(db),
            None => return Ok(Err(format!("Database not found: {}", path.display()))),
        }
    }
    Ok(Ok(databases))
}

/// Open a database whose index must already exist.
fn open_indexed(path: &Path) -> Result<std::result::Result<SqliteDatabase, String>> {
    let Some(db) = open_database(path)? else {
        return Ok(Err(format!("Database not found: {}", path.display())));
    };
    if !db.with_connection(|conn| is_installed(conn))? {
        return Ok(Err(format!(
            "Index not found in {}. Run 'colstats index' first.",
            path.display()
        )));
    }
    Ok(Ok(db))
}

/// Backfill and drain the change queue of each database
fn cmd_index(
    paths: &[PathBuf],
    config: &IndexerConfig,
    format: OutputFormat,
    quiet: bool,
) -> Result<u8> {
    let databases = match open_all(paths)? {
        Ok(databases) => databases,
        Err(message) => return Ok(not_found(&message, format)),
    };

    let mut results = Vec::new();
    for (path, db) in paths.iter().zip(&databases) {
        if !quiet && format == OutputFormat::Text {
            println!("Indexing {}...", path.display());
        }
        let report = reindex(db, config)
            .with_context(|| format!("Failed to index {}", path.display()))?;

        if format == OutputFormat::Text && !quiet {
            println!(
                "Indexed {}: {} batches, {} changes, {} columns completed",
                db.name(),
                report.batches_scanned,
                report.changes_applied,
                report.columns_indexed
            );
        }
        results.push(serde_json::json!({
            "database": path.display().to_string(),
            "batches_scanned": report.batches_scanned,
            "changes_applied": report.changes_applied,
            "columns_indexed": report.columns_indexed,
        }));
    }

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(&results)?);
    }
    Ok(exit_codes::SUCCESS)
}

/// Run the background indexer in the foreground until Ctrl+C
fn cmd_watch(
    paths: &[PathBuf],
    config: IndexerConfig,
    format: OutputFormat,
    quiet: bool,
) -> Result<u8> {
    let databases = match open_all(paths)? {
        Ok(databases) => databases,
        Err(message) => return Ok(not_found(&message, format)),
    };

    let mut engine = Engine::new(config);
    for db in databases {
        engine.watch(Arc::new(db));
    }
    let engine = Arc::new(engine);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    if !quiet && format == OutputFormat::Text {
        println!("Watching {} database(s)... (Ctrl+C to stop)", paths.len());
    }

    runtime.block_on(async move {
        let mut task = engine.spawn();
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                task.abort();
                if !quiet && format == OutputFormat::Text {
                    println!("Stopped.");
                }
                Ok::<u8, anyhow::Error>(exit_codes::SUCCESS)
            }
            _ = &mut task => {
                anyhow::bail!("Background indexing stopped; see log for the cause")
            }
        }
    })
}

/// Autosuggest against an existing index
fn cmd_suggest(
    path: &Path,
    table: &str,
    column: &str,
    prefix: &str,
    config: &IndexerConfig,
    format: OutputFormat,
    quiet: bool,
) -> Result<u8> {
    let db = match open_indexed(path)? {
        Ok(db) => db,
        Err(message) => return Ok(not_found(&message, format)),
    };

    let suggestions = db
        .with_connection(|conn| autosuggest(conn, table, column, prefix, config))
        .context("Autosuggest query failed")?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(&suggestions)?);
    } else if suggestions.is_empty() {
        if !quiet {
            eprintln!("No suggestions for '{}' in {}.{}", prefix, table, column);
        }
    } else {
        for s in &suggestions {
            println!("{}\t{}", s.count, s.value);
        }
    }

    if suggestions.is_empty() {
        Ok(exit_codes::NOT_FOUND)
    } else {
        Ok(exit_codes::SUCCESS)
    }
}

fn print_stats(stats: &ColumnStats) {
    let bound = |v: &Option<colstats::SqlValue>| match v {
        Some(v) => serde_json::to_string(v).unwrap_or_default(),
        None => "-".to_string(),
    };
    let len = |v: Option<i64>| v.map_or("-".to_string(), |n| n.to_string());

    println!(
        "{} ({}{}{}){}",
        stats.column,
        if stats.decl_type.is_empty() { "any" } else { stats.decl_type.as_str() },
        if stats.pk { ", pk" } else { "" },
        if stats.nullable { "" } else { ", not null" },
        if stats.pending { " [backfilling]" } else { "" }
    );
    println!(
        "  count: {}  nulls: {}  integers: {}  reals: {}  texts: {}  blobs: {}",
        stats.count, stats.nulls, stats.integers, stats.reals, stats.texts, stats.blobs
    );
    println!(
        "  json strings: {}  arrays: {}  objects: {}",
        stats.json_strings, stats.json_arrays, stats.json_objects
    );
    println!(
        "  text length: {}..{}  with spaces: {}  with newlines: {}",
        len(stats.texts_min_length),
        len(stats.texts_max_length),
        stats.texts_whitespace,
        stats.texts_newline
    );
    println!(
        "  blob length: {}..{}  min: {}  max: {}",
        len(stats.blobs_min_length),
        len(stats.blobs_max_length),
        bound(&stats.min),
        bound(&stats.max)
    );
}

/// Show stored statistics for a table or one column
fn cmd_stats(
    path: &Path,
    table: &str,
    column: Option<&str>,
    format: OutputFormat,
    quiet: bool,
) -> Result<u8> {
    let db = match open_indexed(path)? {
        Ok(db) => db,
        Err(message) => return Ok(not_found(&message, format)),
    };

    let stats = db
        .with_connection(|conn| -> colstats::Result<Vec<ColumnStats>> {
            match column {
                Some(column) => Ok(column_stats(conn, table, column)?.into_iter().collect()),
                None => table_stats(conn, table),
            }
        })
        .context("Failed to read column statistics")?;

    if stats.is_empty() {
        let target = match column {
            Some(column) => format!("{}.{}", table, column),
            None => table.to_string(),
        };
        return Ok(not_found(&format!("No statistics for {}", target), format));
    }

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        if !quiet {
            println!("Statistics for {} in {}:", table, path.display());
        }
        for s in &stats {
            print_stats(s);
        }
    }
    Ok(exit_codes::SUCCESS)
}

/// Remove triggers and tables from each database
fn cmd_uninstall(paths: &[PathBuf], format: OutputFormat, quiet: bool) -> Result<u8> {
    let databases = match open_all(paths)? {
        Ok(databases) => databases,
        Err(message) => return Ok(not_found(&message, format)),
    };

    for (path, db) in paths.iter().zip(&databases) {
        uninstall(db).with_context(|| format!("Failed to uninstall from {}", path.display()))?;
        if format == OutputFormat::Text && !quiet {
            println!("Removed colstats from {}", path.display());
        }
    }

    if format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::json!({ "uninstalled": paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>() })
        );
    }
    Ok(exit_codes::SUCCESS)
}
