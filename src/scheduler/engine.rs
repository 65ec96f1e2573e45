use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::service::SchedulerService;

/// Dispatch loop. Each tick starts every due schedule entry.
///
/// The tick body is awaited inline, so a slow pass delays the next tick
/// instead of overlapping with it.
pub async fn run_scheduler_loop(
    service: Arc<SchedulerService>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = every.as_secs(), "Scheduler engine started");

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        match service.start_scheduled_tests().await {
            Ok(started) if started.is_empty() => {}
            Ok(started) => {
                for data in &started {
                    info!(test_id = %data.test_id, queue = %data.queue_name, "Scheduled test started");
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to check due tests");
            }
        }
    }
    info!("Scheduler engine stopped");
}

/// Historical maintenance loop: search, save, prune.
pub async fn run_history_loop(
    service: Arc<SchedulerService>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = every.as_secs(), "Historical janitor started");

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        match service.history().tick().await {
            Ok(tick) => {
                info!(merged = tick.merged, saved = tick.saved, deleted = tick.deleted, "Historical janitor pass");
            }
            Err(e) => {
                error!(error = %e, "Historical janitor pass failed");
            }
        }
    }
    info!("Historical janitor stopped");
}
