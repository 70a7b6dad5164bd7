//! Sync state models shared by the queue, the engine and callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{EntityKind, RecordKey};

/// Periodic reconciliation cadence in seconds.
pub const RECONCILE_INTERVAL_SECS: u64 = 30;

/// Pending count above which a pass runs immediately instead of waiting for
/// the next tick.
pub const DIRTY_THRESHOLD: usize = 5;

/// An entity whose current local state (or absence) still has to be pushed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyItem {
    pub id: String,
    pub collection: EntityKind,
}

impl DirtyItem {
    pub fn new(id: impl Into<String>, collection: EntityKind) -> Self {
        Self {
            id: id.into(),
            collection,
        }
    }

    /// Key for the remote write. Parent ids are filled from the entity's
    /// current value when it still exists.
    pub fn record_key(&self, value: Option<&serde_json::Value>) -> RecordKey {
        let mut key = RecordKey::new(self.collection, &self.id);
        let field = |name: &str| {
            value
                .and_then(|v| v.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        key.trip_id = match self.collection {
            EntityKind::Trip => Some(self.id.clone()),
            _ => field("tripId"),
        };
        key.dashboard_id = match self.collection {
            EntityKind::Dashboard => Some(self.id.clone()),
            _ => field("dashboardId"),
        };
        key
    }
}

/// Point-in-time view for user feedback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub pending_changes: usize,
}

/// Broadcast after every reconciliation pass that did work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncNotice {
    #[serde(rename_all = "camelCase")]
    SyncCompleted { upserted: usize, deleted: usize },
    #[serde(rename_all = "camelCase")]
    SyncFailed { failed: usize, message: String },
}

/// Why a requested pass did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
    NothingPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    Skipped(SkipReason),
    Completed,
    PartiallyFailed,
    Failed,
}

/// Outcome of one call to `force_sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub status: ReconcileStatus,
    pub upserted: usize,
    pub deleted: usize,
    pub failed: Vec<DirtyItem>,
}

impl ReconcileReport {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            status: ReconcileStatus::Skipped(reason),
            upserted: 0,
            deleted: 0,
            failed: Vec::new(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, ReconcileStatus::Skipped(_))
    }
}
