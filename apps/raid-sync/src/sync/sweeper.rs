//! Background eviction of idle sessions and expired views.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::coordinator::SyncCoordinator;

/// Spawn the sweeper. It runs until the returned handle is aborted.
pub fn spawn(
    coordinator: SyncCoordinator,
    interval: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // First tick fires immediately; skip it.

        loop {
            ticker.tick().await;
            let report = coordinator.sweep(idle_timeout).await;
            if report.evicted_sessions > 0 || report.purged_views > 0 {
                tracing::info!(
                    evicted_sessions = report.evicted_sessions,
                    purged_views = report.purged_views,
                    "sweeper pass"
                );
            }
        }
    })
}
