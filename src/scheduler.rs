use crate::updater::Updater;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// refresh immediately, then every `interval`, until `cancel` fires
///
/// a cycle that overruns the interval delays the next one instead of
/// bunching them up.
pub fn spawn_schedule_loop(
    updater: Arc<Updater>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!("Schedule loop ready.");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Shutting down refresh loop");
                    return;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    tracing::debug!("Updating all at {}", now);
                    updater.refresh_all(now, &cancel).await;
                }
            }
        }
    })
}
