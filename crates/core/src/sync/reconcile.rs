//! Reconciliation engine: drains the dirty queue against the remote store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info};
use tokio::sync::{broadcast, watch, Notify};

use super::{
    ConnectivityMonitor, DirtyItem, DirtyQueue, ReconcileReport, ReconcileStatus, SkipReason,
    SyncNotice, SyncStatus,
};
use crate::errors::{Error, Result};
use crate::models::EntityKind;
use crate::remote::{DocumentPatch, RemoteMode, RemoteRepository};
use crate::state::{read_state, SharedState};

const NOTICE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pushed {
    Upserted,
    Deleted,
}

/// Pushes the current live value (or absence) of every dirty entity.
///
/// Each item goes to the layout [`RemoteMode::for_entity`] picks for it:
/// the user namespace, or the trip tree once the entity is shared.
///
/// Passes are single-flight: a request arriving while one runs is dropped,
/// not queued. Only items that were in the pass snapshot and whose write
/// succeeded leave the queue.
pub struct ReconciliationEngine {
    state: SharedState,
    queue: Arc<DirtyQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    remote: Arc<dyn RemoteRepository>,
    trip_tree: Option<Arc<dyn RemoteRepository>>,
    dirty_threshold: usize,
    syncing: AtomicBool,
    last_synced_at: Mutex<Option<DateTime<Utc>>>,
    status_tx: watch::Sender<SyncStatus>,
    notices: broadcast::Sender<SyncNotice>,
    threshold: Notify,
}

/// Clears the single-flight flag however the pass ends.
struct PassGuard<'a> {
    engine: &'a ReconciliationEngine,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.engine.syncing.store(false, Ordering::SeqCst);
        self.engine.publish_status();
    }
}

impl ReconciliationEngine {
    pub fn new(
        state: SharedState,
        queue: Arc<DirtyQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        remote: Arc<dyn RemoteRepository>,
        dirty_threshold: usize,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let engine = Self {
            state,
            queue,
            connectivity,
            remote,
            trip_tree: None,
            dirty_threshold,
            syncing: AtomicBool::new(false),
            last_synced_at: Mutex::new(None),
            status_tx,
            notices,
            threshold: Notify::new(),
        };
        engine.publish_status();
        engine
    }

    /// Repository for items that live in a shared trip tree.
    pub fn with_trip_tree(mut self, trip_tree: Arc<dyn RemoteRepository>) -> Self {
        self.trip_tree = Some(trip_tree);
        self
    }

    fn repository(&self, mode: RemoteMode) -> Result<&dyn RemoteRepository> {
        match mode {
            RemoteMode::UserScoped => Ok(self.remote.as_ref()),
            RemoteMode::TripTree => self.trip_tree.as_deref().ok_or_else(|| {
                Error::Unexpected("no trip-tree repository configured".to_string())
            }),
        }
    }

    pub fn queue(&self) -> &Arc<DirtyQueue> {
        &self.queue
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn pending_changes(&self) -> usize {
        self.queue.pending_changes()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at.lock().ok().and_then(|guard| *guard)
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.connectivity.is_online(),
            is_syncing: self.is_syncing(),
            last_synced_at: self.last_synced_at(),
            pending_changes: self.pending_changes(),
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    /// Applies a connectivity transition and republishes status.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
        self.publish_status();
    }

    /// Resolves once the pending count has exceeded the dirty threshold.
    pub(crate) async fn threshold_reached(&self) {
        self.threshold.notified().await
    }

    /// Records a locally originated mutation and wakes the background
    /// engine when the pending count passes the threshold.
    pub async fn mark_dirty(&self, id: &str, collection: EntityKind) -> Result<()> {
        self.queue.mark_dirty(id, collection).await?;
        self.publish_status();
        let pending = self.queue.pending_changes();
        if pending > self.dirty_threshold {
            debug!(
                "[Reconcile] {} pending change(s) exceed threshold {}",
                pending, self.dirty_threshold
            );
            self.threshold.notify_one();
        }
        Ok(())
    }

    pub async fn force_sync(&self) -> Result<ReconcileReport> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("[Reconcile] Pass already running, request dropped");
            return Ok(ReconcileReport::skipped(SkipReason::AlreadySyncing));
        }
        let _guard = PassGuard { engine: self };

        if !self.connectivity.is_online() {
            debug!("[Reconcile] Offline, skipping pass");
            return Ok(ReconcileReport::skipped(SkipReason::Offline));
        }
        let snapshot = self.queue.begin_pass()?;
        if snapshot.is_empty() {
            return Ok(ReconcileReport::skipped(SkipReason::NothingPending));
        }
        self.publish_status();

        let lookups = {
            let state = read_state(&self.state)?;
            snapshot
                .into_iter()
                .map(|item| {
                    let value = state.lookup_value(item.collection, &item.id)?;
                    let mode = RemoteMode::for_entity(
                        item.collection,
                        state.in_shared_tree(item.collection, &item.id),
                    );
                    Ok((item, mode, value))
                })
                .collect::<Result<Vec<_>>>()?
        };
        debug!("[Reconcile] Pushing {} dirty item(s)", lookups.len());

        let results = join_all(
            lookups
                .into_iter()
                .map(|(item, mode, value)| self.push_item(item, mode, value)),
        )
        .await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut first_error = None;
        let (mut upserted, mut deleted) = (0, 0);
        for (item, result) in results {
            match result {
                Ok(Pushed::Upserted) => {
                    upserted += 1;
                    succeeded.push(item);
                }
                Ok(Pushed::Deleted) => {
                    deleted += 1;
                    succeeded.push(item);
                }
                Err(err) => {
                    error!(
                        "[Reconcile] Failed to push {} {}: {}",
                        item.collection, item.id, err
                    );
                    first_error.get_or_insert_with(|| err.to_string());
                    failed.push(item);
                }
            }
        }

        self.queue.remove(&succeeded).await?;

        let status = match (failed.is_empty(), succeeded.is_empty()) {
            (true, _) => ReconcileStatus::Completed,
            (false, true) => ReconcileStatus::Failed,
            (false, false) => ReconcileStatus::PartiallyFailed,
        };
        if failed.is_empty() {
            if let Ok(mut last) = self.last_synced_at.lock() {
                *last = Some(Utc::now());
            }
            info!(
                "[Reconcile] Pass complete: {} upserted, {} deleted",
                upserted, deleted
            );
            let _ = self
                .notices
                .send(SyncNotice::SyncCompleted { upserted, deleted });
        } else {
            let _ = self.notices.send(SyncNotice::SyncFailed {
                failed: failed.len(),
                message: first_error.unwrap_or_default(),
            });
        }

        Ok(ReconcileReport {
            status,
            upserted,
            deleted,
            failed,
        })
    }

    async fn push_item(
        &self,
        item: DirtyItem,
        mode: RemoteMode,
        value: Option<serde_json::Value>,
    ) -> (DirtyItem, Result<Pushed>) {
        let result = self.push_value(&item, mode, value).await;
        (item, result)
    }

    async fn push_value(
        &self,
        item: &DirtyItem,
        mode: RemoteMode,
        value: Option<serde_json::Value>,
    ) -> Result<Pushed> {
        let remote = self.repository(mode)?;
        let key = item.record_key(value.as_ref());
        match value {
            Some(value) => {
                let patch = DocumentPatch::from_value(value)?;
                remote.save(&key, patch).await?;
                Ok(Pushed::Upserted)
            }
            None => {
                remote.delete(&key).await?;
                Ok(Pushed::Deleted)
            }
        }
    }
}
