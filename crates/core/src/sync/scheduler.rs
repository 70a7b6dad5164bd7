//! Background loop that drives reconciliation passes.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::ReconciliationEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Threshold,
    Connectivity { alive: bool },
}

/// Runs a pass on every tick while items are pending, immediately when the
/// dirty threshold is exceeded, and when connectivity comes back.
pub struct SyncScheduler {
    engine: Arc<ReconciliationEngine>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<ReconciliationEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            task: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn ensure_started(&self) {
        let mut guard = self.task.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
            guard.take();
        }
        let engine = Arc::clone(&self.engine);
        let interval = self.interval;
        // Subscribe before spawning so a transition right after start is seen.
        let online_rx = engine.connectivity().subscribe();
        *guard = Some(tokio::spawn(run_loop(engine, online_rx, interval)));
        info!(
            "[Reconcile] Background engine started (interval {}s)",
            interval.as_secs()
        );
    }

    pub async fn ensure_stopped(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            info!("[Reconcile] Background engine stopped");
        }
    }
}

async fn run_loop(
    engine: Arc<ReconciliationEngine>,
    mut online_rx: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let trigger = tokio::select! {
            _ = ticker.tick() => Trigger::Timer,
            _ = engine.threshold_reached() => Trigger::Threshold,
            changed = online_rx.changed() => Trigger::Connectivity { alive: changed.is_ok() },
        };

        if let Trigger::Connectivity { alive } = trigger {
            if !alive {
                break;
            }
            engine.publish_status();
            if !*online_rx.borrow_and_update() {
                continue;
            }
        }
        if engine.pending_changes() == 0 {
            continue;
        }

        match engine.force_sync().await {
            Ok(report) => debug!(
                "[Reconcile] {:?} pass finished status={:?} upserted={} deleted={} failed={}",
                trigger,
                report.status,
                report.upserted,
                report.deleted,
                report.failed.len()
            ),
            Err(err) => warn!("[Reconcile] {:?} pass errored: {}", trigger, err),
        }
    }
}
