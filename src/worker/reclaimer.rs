//! Stale-lease reclaimer.
//!
//! A task stays `running` forever if its worker died mid-execution. On pool
//! startup, and then on an interval, any `running` task whose lease is older
//! than the threshold goes back to `pending`. Attempt counts are kept, so a
//! task that keeps crashing its worker still runs out of attempts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::TaskStore;

/// Default lease staleness threshold: 5 minutes.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

/// Run one sweep. Store failures are logged, not returned.
pub async fn reclaim_stale(store: &dyn TaskStore, stale_after: Duration) -> usize {
    match store.recover_stale_running(stale_after).await {
        Ok(0) => {
            debug!("No stale running tasks");
            0
        }
        Ok(count) => {
            info!(
                count,
                stale_secs = stale_after.as_secs(),
                "Reclaimed stale running tasks"
            );
            count
        }
        Err(e) => {
            warn!(error = %e, "Stale-lease sweep failed");
            0
        }
    }
}

/// Spawn the periodic sweep. The first sweep runs one `interval` after start.
pub fn spawn_reclaimer(
    store: Arc<dyn TaskStore>,
    stale_after: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Stale-lease reclaimer started (interval: {}s, threshold: {}s)",
            interval.as_secs(),
            stale_after.as_secs()
        );

        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            reclaim_stale(store.as_ref(), stale_after).await;
        }
        debug!("Stale-lease reclaimer stopped");
    })
}
