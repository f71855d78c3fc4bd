//! Background synchronization driven by connectivity and a timer.
//!
//! The task syncs when connectivity flips from offline to online and, if an
//! interval is configured, on every tick while online. Each report is handed
//! to a callback; failures are also logged, and the cache keeps working
//! offline.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::{SyncEngine, SyncReport};

/// Owns the background task; dropping the handle stops it.
#[derive(Debug)]
pub struct AutoSyncHandle {
    task: JoinHandle<()>,
}

impl AutoSyncHandle {
    pub fn stop(self) {
        // Drop aborts.
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for AutoSyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawns the auto-sync task.
///
/// `connectivity` carries `true` while the device is online. The task ends
/// when the sending side of the channel is dropped. `on_report` sees every
/// finished cycle.
pub fn spawn_auto_sync<F>(
    engine: Arc<SyncEngine>,
    mut connectivity: watch::Receiver<bool>,
    every: Option<Duration>,
    on_report: F,
) -> AutoSyncHandle
where
    F: Fn(&SyncReport) + Send + Sync + 'static,
{
    let task = tokio::spawn(async move {
        let mut online = *connectivity.borrow_and_update();
        let mut ticker = every.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        if let Some(ticker) = ticker.as_mut() {
            // The first tick fires immediately.
            ticker.tick().await;
        }

        loop {
            let ticking = online && ticker.is_some();
            tokio::select! {
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        tracing::debug!("connectivity channel closed; auto-sync stopping");
                        break;
                    }
                    let now_online = *connectivity.borrow_and_update();
                    if now_online && !online {
                        tracing::info!("back online; syncing");
                        run(&engine, &on_report).await;
                    }
                    online = now_online;
                }
                _ = tick(ticker.as_mut()), if ticking => {
                    tracing::debug!("auto-sync tick");
                    run(&engine, &on_report).await;
                }
            }
        }
    });

    AutoSyncHandle { task }
}

async fn tick(ticker: Option<&mut tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run(engine: &SyncEngine, on_report: &(impl Fn(&SyncReport) + Sync)) {
    let report = engine.sync().await;
    if let Some(e) = &report.pull_error {
        tracing::warn!(error = %e, "auto-sync: pull failed");
    }
    on_report(&report);
}
