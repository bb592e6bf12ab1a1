//! Idle session reaper.
//!
//! Sweeps the registry at a fixed interval and terminates sessions that have
//! sat idle past the configured timeout.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::orchestrator::session_manager::SessionManager;

/// Spawn the reaper. The first sweep runs one `interval` after start.
#[must_use]
pub fn spawn_reaper(
    manager: SessionManager,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("idle reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let reaped = manager.reap_idle().await;
                    if reaped.is_empty() {
                        debug!("idle sweep found nothing to reap");
                    } else {
                        info!(count = reaped.len(), "idle sweep reaped sessions");
                    }
                }
            }
        }
    })
}
