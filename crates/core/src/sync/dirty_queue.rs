//! Ordered, deduplicated set of pending local mutations.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use super::DirtyItem;
use crate::errors::{Error, Result};
use crate::models::EntityKind;
use crate::store::DirtyItemStore;

#[derive(Debug, Default)]
struct QueueState {
    items: Vec<DirtyItem>,
    /// Items handed to the running pass by [`DirtyQueue::begin_pass`].
    in_flight: Vec<DirtyItem>,
    /// In-flight items marked again after the pass read their value.
    remarked: Vec<DirtyItem>,
}

/// In-memory dirty list mirrored to a [`DirtyItemStore`] under one user id.
///
/// Every change is persisted before it becomes visible in memory, so a
/// failed persist leaves the queue unchanged and the error reaches the
/// caller.
pub struct DirtyQueue {
    state: Mutex<QueueState>,
    store: Arc<dyn DirtyItemStore>,
    user_id: String,
}

impl DirtyQueue {
    pub fn new(store: Arc<dyn DirtyItemStore>, user_id: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            store,
            user_id: user_id.into(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| Error::Unexpected("Dirty queue lock is poisoned".to_string()))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Replaces the in-memory list with what was persisted for this user.
    pub async fn restore(&self) -> Result<usize> {
        let mut persisted = self.store.load_dirty_items(&self.user_id).await?;
        let mut seen = Vec::with_capacity(persisted.len());
        persisted.retain(|item| {
            if seen.contains(item) {
                return false;
            }
            seen.push(item.clone());
            true
        });
        let count = persisted.len();
        *self.lock()? = QueueState {
            items: persisted,
            ..QueueState::default()
        };
        debug!(
            "[DirtyQueue] Restored {} pending item(s) for user {}",
            count, self.user_id
        );
        Ok(count)
    }

    /// Marks an entity dirty. Returns `false` when an identical item was
    /// already pending. Marking an item the running pass is pushing keeps
    /// it queued after that pass.
    pub async fn mark_dirty(&self, id: &str, collection: EntityKind) -> Result<bool> {
        let item = DirtyItem::new(id, collection);
        if self.note_pending(&item)? {
            return Ok(false);
        }
        self.store
            .save_dirty_item(&self.user_id, item.clone())
            .await?;
        let mut state = self.lock()?;
        if state.items.contains(&item) {
            return Ok(false);
        }
        state.items.push(item);
        Ok(true)
    }

    /// Returns whether the item is already queued, recording a re-mark when
    /// it is in flight.
    fn note_pending(&self, item: &DirtyItem) -> Result<bool> {
        let mut state = self.lock()?;
        if !state.items.contains(item) {
            return Ok(false);
        }
        if state.in_flight.contains(item) && !state.remarked.contains(item) {
            debug!(
                "[DirtyQueue] {} {} changed while being pushed",
                item.collection, item.id
            );
            state.remarked.push(item.clone());
        }
        Ok(true)
    }

    pub fn pending_changes(&self) -> usize {
        match self.lock() {
            Ok(state) => state.items.len(),
            Err(err) => {
                warn!("[DirtyQueue] Cannot count pending changes: {}", err);
                0
            }
        }
    }

    pub fn contains(&self, id: &str, collection: EntityKind) -> bool {
        match self.lock() {
            Ok(state) => state
                .items
                .iter()
                .any(|i| i.id == id && i.collection == collection),
            Err(err) => {
                warn!(
                    "[DirtyQueue] Cannot check {} {} for pending changes: {}",
                    collection, id, err
                );
                false
            }
        }
    }

    pub fn snapshot(&self) -> Result<Vec<DirtyItem>> {
        Ok(self.lock()?.items.clone())
    }

    /// Takes the snapshot a reconciliation pass pushes and tracks it as in
    /// flight until [`remove`](Self::remove) runs.
    pub fn begin_pass(&self) -> Result<Vec<DirtyItem>> {
        let mut state = self.lock()?;
        state.in_flight = state.items.clone();
        state.remarked.clear();
        Ok(state.in_flight.clone())
    }

    /// Drops the given items and ends the pass. Items marked after the
    /// caller took its snapshot, or marked again while in flight, stay
    /// queued.
    pub async fn remove(&self, done: &[DirtyItem]) -> Result<()> {
        let removable: Vec<DirtyItem> = {
            let mut state = self.lock()?;
            let removable = done
                .iter()
                .filter(|item| !state.remarked.contains(item))
                .cloned()
                .collect();
            state.remarked.retain(|item| !done.contains(item));
            removable
        };
        if !removable.is_empty() {
            self.store
                .remove_dirty_items(&self.user_id, removable.clone())
                .await?;
        }

        // Re-marks that landed while the rows were being deleted.
        let resurrect: Vec<DirtyItem> = {
            let mut state = self.lock()?;
            let resurrect: Vec<DirtyItem> = removable
                .iter()
                .filter(|item| state.remarked.contains(item))
                .cloned()
                .collect();
            state
                .items
                .retain(|item| !removable.contains(item) || resurrect.contains(item));
            state.in_flight.clear();
            state.remarked.clear();
            resurrect
        };
        for item in resurrect {
            self.store.save_dirty_item(&self.user_id, item).await?;
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear_dirty_items(&self.user_id).await?;
        *self.lock()? = QueueState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLocalStore;

    #[tokio::test]
    async fn marking_twice_keeps_one_item() {
        let store = Arc::new(MemoryLocalStore::new());
        let queue = DirtyQueue::new(store.clone(), "u1");

        assert!(queue.mark_dirty("c1", EntityKind::Card).await.expect("mark"));
        for _ in 0..4 {
            assert!(!queue.mark_dirty("c1", EntityKind::Card).await.expect("mark"));
        }
        assert!(queue.mark_dirty("c1", EntityKind::Trip).await.expect("mark"));
        assert_eq!(queue.pending_changes(), 2);
        assert_eq!(store.load_dirty_items("u1").await.expect("load").len(), 2);
    }

    #[tokio::test]
    async fn restore_is_scoped_to_the_user() {
        let store = Arc::new(MemoryLocalStore::new());
        DirtyQueue::new(store.clone(), "u1")
            .mark_dirty("c1", EntityKind::Card)
            .await
            .expect("mark");

        let other = DirtyQueue::new(store.clone(), "u2");
        assert_eq!(other.restore().await.expect("restore"), 0);

        let same = DirtyQueue::new(store, "u1");
        assert_eq!(same.restore().await.expect("restore"), 1);
        assert!(same.contains("c1", EntityKind::Card));
    }

    #[tokio::test]
    async fn remove_keeps_items_marked_after_the_snapshot() {
        let store = Arc::new(MemoryLocalStore::new());
        let queue = DirtyQueue::new(store, "u1");
        queue.mark_dirty("c1", EntityKind::Card).await.expect("mark");
        let snapshot = queue.snapshot().expect("snapshot");
        queue.mark_dirty("c2", EntityKind::Card).await.expect("mark");

        queue.remove(&snapshot).await.expect("remove");
        assert_eq!(
            queue.snapshot().expect("snapshot"),
            vec![DirtyItem::new("c2", EntityKind::Card)]
        );
    }

    #[tokio::test]
    async fn remarking_an_in_flight_item_keeps_it_queued() {
        let store = Arc::new(MemoryLocalStore::new());
        let queue = DirtyQueue::new(store.clone(), "u1");
        queue.mark_dirty("c1", EntityKind::Card).await.expect("mark");
        queue.mark_dirty("c2", EntityKind::Card).await.expect("mark");
        let pass = queue.begin_pass().expect("pass");

        assert!(!queue.mark_dirty("c1", EntityKind::Card).await.expect("mark"));
        queue.remove(&pass).await.expect("remove");

        assert_eq!(
            queue.snapshot().expect("snapshot"),
            vec![DirtyItem::new("c1", EntityKind::Card)]
        );
        assert_eq!(store.load_dirty_items("u1").await.expect("load").len(), 1);

        // The next pass drains it.
        let pass = queue.begin_pass().expect("pass");
        queue.remove(&pass).await.expect("remove");
        assert_eq!(queue.pending_changes(), 0);
    }

    #[test]
    fn poisoned_lock_reads_as_empty_but_errors_on_snapshot() {
        let queue = DirtyQueue::new(Arc::new(MemoryLocalStore::new()), "u1");
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = queue.state.lock().expect("lock");
            panic!("poison the queue lock");
        }));

        assert_eq!(queue.pending_changes(), 0);
        assert!(!queue.contains("c1", EntityKind::Card));
        assert!(matches!(queue.snapshot(), Err(Error::Unexpected(_))));
    }

    #[tokio::test]
    async fn failed_persist_leaves_queue_unchanged() {
        let store = Arc::new(MemoryLocalStore::new());
        let queue = DirtyQueue::new(store.clone(), "u1");
        store.set_fail_writes(true);
        assert!(queue.mark_dirty("c1", EntityKind::Card).await.is_err());
        assert_eq!(queue.pending_changes(), 0);
    }
}
