//! Cooperative background scheduler.
//!
//! One task drives every watched database. Each step first tries to advance
//! a backfill, and only when no column is pending does it apply a queued
//! change. Steps run on the blocking pool since rusqlite is synchronous.
//! A pass over all databases that finds nothing to do sleeps before the
//! next one. Any error stops the task.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::backfill::index_next_backfill_batch;
use crate::config::IndexerConfig;
use crate::db::Database;
use crate::pending::index_pending_rows;
use crate::schema::{self, ensure_schema};
use crate::store::{ensure_cursors, pending_columns};
use crate::triggers::ensure_triggers;
use crate::{IndexError, Result};

/// What a single scheduler step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Scanned one backfill chunk.
    Backfilled,
    /// Applied one queued change.
    Applied,
    /// Nothing to do.
    Idle,
}

impl StepOutcome {
    pub fn did_work(self) -> bool {
        self != StepOutcome::Idle
    }
}

/// Bring a database up to date with the indexer: auxiliary tables, capture
/// triggers and backfill cursors.
pub fn prepare_database<D: Database>(db: &D) -> Result<()> {
    db.with_connection(|conn| {
        if ensure_schema(conn)? {
            info!("Rebuilt index tables for {}", db.name());
        }
        ensure_triggers(conn)?;
        ensure_cursors(conn)?;
        Ok(())
    })
}

/// Run one step against a database.
pub fn step<D: Database>(db: &D, config: &IndexerConfig) -> Result<StepOutcome> {
    db.with_connection(|conn| {
        if index_next_backfill_batch(conn, config)? {
            return Ok(StepOutcome::Backfilled);
        }
        if index_pending_rows(conn, config)? {
            return Ok(StepOutcome::Applied);
        }
        Ok(StepOutcome::Idle)
    })
}

/// Outcome of [`reindex`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    pub batches_scanned: usize,
    pub changes_applied: usize,
    /// Columns whose backfill finished during this run.
    pub columns_indexed: usize,
}

/// Prepare a database and drive it until there is no work left.
pub fn reindex<D: Database>(db: &D, config: &IndexerConfig) -> Result<ReindexReport> {
    prepare_database(db)?;
    let pending_before = db.with_connection(|conn| pending_columns(conn))?;

    let mut report = ReindexReport::default();
    loop {
        match step(db, config)? {
            StepOutcome::Backfilled => report.batches_scanned += 1,
            StepOutcome::Applied => report.changes_applied += 1,
            StepOutcome::Idle => break,
        }
    }

    let pending_after = db.with_connection(|conn| pending_columns(conn))?;
    report.columns_indexed = pending_before.saturating_sub(pending_after);

    info!(
        "Reindexed {}: {} batches, {} changes, {} columns",
        db.name(),
        report.batches_scanned,
        report.changes_applied,
        report.columns_indexed
    );
    Ok(report)
}

/// Remove every trigger and table the indexer created.
pub fn uninstall<D: Database>(db: &D) -> Result<()> {
    db.with_connection(schema::uninstall)?;
    info!("Uninstalled index from {}", db.name());
    Ok(())
}

/// The background indexer for a set of databases.
pub struct Engine<D: Database> {
    config: IndexerConfig,
    databases: Vec<Arc<D>>,
}

impl<D: Database> Engine<D> {
    pub fn new(config: IndexerConfig) -> Self {
        Self {
            config,
            databases: Vec::new(),
        }
    }

    /// Add a database to the set the engine maintains.
    pub fn watch(&mut self, db: Arc<D>) {
        debug!("Watching {}", db.name());
        self.databases.push(db);
    }

    pub fn databases(&self) -> &[Arc<D>] {
        &self.databases
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Prepare every watched database.
    pub fn prepare(&self) -> Result<()> {
        for db in &self.databases {
            prepare_database(db.as_ref())?;
        }
        Ok(())
    }

    pub fn step(&self, db: &D) -> Result<StepOutcome> {
        step(db, &self.config)
    }

    /// One synchronous pass over all databases. Returns whether any step
    /// did work.
    pub fn tick(&self) -> Result<bool> {
        let mut did_work = false;
        for db in &self.databases {
            did_work |= self.step(db)?.did_work();
        }
        Ok(did_work)
    }

    /// Prepare, then step forever. Only returns on error.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let engine = Arc::clone(&self);
        tokio::task::spawn_blocking(move || engine.prepare())
            .await
            .map_err(|e| IndexError::TaskFailed(e.to_string()))??;

        info!("Indexing {} database(s)", self.databases.len());

        loop {
            let mut did_work = false;

            for db in &self.databases {
                let db = Arc::clone(db);
                let config = self.config.clone();
                let outcome = tokio::task::spawn_blocking(move || step(db.as_ref(), &config))
                    .await
                    .map_err(|e| IndexError::TaskFailed(e.to_string()))??;
                did_work |= outcome.did_work();

                tokio::task::yield_now().await;
            }

            if !did_work {
                tokio::time::sleep(self.config.idle_sleep()).await;
            }
        }
    }

    /// Run the engine on its own task. A fatal error is logged and ends it.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!("Background indexing stopped: {}", e);
            }
        })
    }
}
