//! pewpew-scheduler -- Test scheduler control plane for load tests.
//!
//! This crate keeps the durable map of scheduled load tests, dispatches due
//! runs onto the agent queue, computes the next occurrence of recurring
//! tests, and maintains the calendar of finished runs.

pub mod config;
pub mod error;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::config::SchedulerConfig;
use crate::scheduler::{Collaborators, SchedulerService, SharedState};

/// Build the production collaborators described by `config`: a
/// filesystem object store and the SQLite-backed queue and status store.
pub fn build_collaborators(config: &SchedulerConfig) -> Result<Collaborators> {
    tracing::info!(db_path = %config.database.path, "Initializing database");
    let pool = storage::open_pool(&config.database.path)
        .with_context(|| format!("failed to open database {}", config.database.path))?;

    tracing::info!(object_root = %config.storage.object_root.display(), "Using object store");
    Ok(Collaborators {
        objects: Arc::new(storage::FsObjectStore::new(&config.storage.object_root)),
        queue: Arc::new(storage::SqliteQueue::new(pool.clone())),
        status: Arc::new(storage::SqliteStatusStore::new(pool)),
    })
}

/// Build a scheduler service wired to the production collaborators.
pub fn build_service(config: &SchedulerConfig, shared: SharedState) -> Result<SchedulerService> {
    let collaborators = build_collaborators(config)?;
    Ok(SchedulerService::new(collaborators, shared, config.service_options()?))
}

/// Run the scheduler daemon: dispatch loop plus historical janitor, until
/// Ctrl-C.
pub async fn serve(config: SchedulerConfig) -> Result<()> {
    let service = Arc::new(build_service(&config, SharedState::default())?);

    let loaded = service.load_tests(true).await?;
    tracing::info!(scheduled = loaded, "Schedule map loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatch = tokio::spawn(scheduler::run_scheduler_loop(
        Arc::clone(&service),
        config.scheduler.interval(),
        shutdown_rx.clone(),
    ));
    let history = tokio::spawn(scheduler::run_history_loop(
        Arc::clone(&service),
        config.history.interval(),
        shutdown_rx,
    ));

    tracing::info!("pewpew-scheduler running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    dispatch.await?;
    history.await?;

    Ok(())
}
