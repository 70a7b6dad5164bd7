//! Non-durable store used for ephemeral sessions and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ensure_local, DirtyItemStore, LocalStore};
use crate::errors::{DatabaseError, Error, Result};
use crate::models::EntityKind;
use crate::sync::DirtyItem;

#[derive(Debug, Default)]
struct Tables {
    collections: HashMap<EntityKind, BTreeMap<String, serde_json::Value>>,
    meta: BTreeMap<String, String>,
    dirty: HashMap<String, Vec<DirtyItem>>,
}

#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail as if storage quota were exhausted.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| {
            Error::Database(DatabaseError::Internal(
                "Memory store lock is poisoned".to_string(),
            ))
        })
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Database(DatabaseError::QueryFailed(
                "storage quota exceeded".to_string(),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get_all(&self, kind: EntityKind) -> Result<Vec<serde_json::Value>> {
        ensure_local(kind)?;
        Ok(self
            .tables()?
            .collections
            .get(&kind)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put(&self, kind: EntityKind, id: &str, value: serde_json::Value) -> Result<()> {
        ensure_local(kind)?;
        self.check_writable()?;
        self.tables()?
            .collections
            .entry(kind)
            .or_default()
            .insert(id.to_string(), value);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        ensure_local(kind)?;
        self.check_writable()?;
        if let Some(rows) = self.tables()?.collections.get_mut(&kind) {
            rows.remove(id);
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables()?;
        tables.collections.clear();
        tables.meta.clear();
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self.tables()?.meta.get(key).cloned())
    }

    async fn set_meta(&self, key: &str, value: Option<String>) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables()?;
        match value {
            Some(value) => tables.meta.insert(key.to_string(), value),
            None => tables.meta.remove(key),
        };
        Ok(())
    }
}

#[async_trait]
impl DirtyItemStore for MemoryLocalStore {
    async fn load_dirty_items(&self, user_id: &str) -> Result<Vec<DirtyItem>> {
        Ok(self
            .tables()?
            .dirty
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_dirty_item(&self, user_id: &str, item: DirtyItem) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables()?;
        let items = tables.dirty.entry(user_id.to_string()).or_default();
        if !items.contains(&item) {
            items.push(item);
        }
        Ok(())
    }

    async fn remove_dirty_items(&self, user_id: &str, items: Vec<DirtyItem>) -> Result<()> {
        self.check_writable()?;
        if let Some(stored) = self.tables()?.dirty.get_mut(user_id) {
            stored.retain(|item| !items.contains(item));
        }
        Ok(())
    }

    async fn clear_dirty_items(&self, user_id: &str) -> Result<()> {
        self.check_writable()?;
        self.tables()?.dirty.remove(user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Card;
    use crate::store::{load_entities, put_entity};

    #[tokio::test]
    async fn put_then_get_all_round_trips() {
        let store = MemoryLocalStore::new();
        let card = Card::new("d1", "Sagrada Familia");
        put_entity(&store, &card).await.expect("put");

        let cards: Vec<Card> = load_entities(&store).await.expect("load");
        assert_eq!(cards, vec![card.clone()]);

        store.delete(EntityKind::Card, &card.id).await.expect("delete");
        store.delete(EntityKind::Card, &card.id).await.expect("delete twice");
        assert!(store.get_all(EntityKind::Card).await.expect("get").is_empty());
    }

    #[tokio::test]
    async fn non_local_collections_are_rejected() {
        let store = MemoryLocalStore::new();
        let err = store
            .get_all(EntityKind::Expense)
            .await
            .expect_err("expenses are not local");
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn failed_writes_surface_as_errors() {
        let store = MemoryLocalStore::new();
        store.set_fail_writes(true);
        let err = put_entity(&store, &Card::new("d1", "x"))
            .await
            .expect_err("write should fail");
        assert!(matches!(err, Error::Database(_)));
    }
}
