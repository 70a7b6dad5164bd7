//! Device-local persistence contracts.

mod memory;

pub use memory::MemoryLocalStore;

use async_trait::async_trait;

use crate::errors::{Error, Result};
use crate::models::{Entity, EntityKind};
use crate::sync::DirtyItem;

/// Meta key holding the id of the trip the user last had open.
pub const META_ACTIVE_TRIP_ID: &str = "activeTripId";

/// Durable, collection-partitioned entity storage.
///
/// Entities are stored as JSON objects carrying an `id` field. Only kinds for
/// which [`EntityKind::is_local`] holds have a local collection.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Every persisted entity of a collection; empty when there are none.
    async fn get_all(&self, kind: EntityKind) -> Result<Vec<serde_json::Value>>;

    /// Upserts by id.
    async fn put(&self, kind: EntityKind, id: &str, value: serde_json::Value) -> Result<()>;

    /// Removes an entity; absent ids are a no-op.
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<()>;

    /// Wipes every collection and the meta table in one transaction.
    async fn clear_all(&self) -> Result<()>;

    async fn get_meta(&self, key: &str) -> Result<Option<String>>;

    async fn set_meta(&self, key: &str, value: Option<String>) -> Result<()>;
}

/// Persistence for the dirty queue, scoped per authenticated user.
#[async_trait]
pub trait DirtyItemStore: Send + Sync {
    /// Items in the order they were first marked.
    async fn load_dirty_items(&self, user_id: &str) -> Result<Vec<DirtyItem>>;

    /// Appends an item unless an identical one is already stored.
    async fn save_dirty_item(&self, user_id: &str, item: DirtyItem) -> Result<()>;

    async fn remove_dirty_items(&self, user_id: &str, items: Vec<DirtyItem>) -> Result<()>;

    async fn clear_dirty_items(&self, user_id: &str) -> Result<()>;
}

pub(crate) fn ensure_local(kind: EntityKind) -> Result<()> {
    if kind.is_local() {
        return Ok(());
    }
    Err(Error::invalid_input(format!(
        "'{}' has no local collection",
        kind
    )))
}

/// Loads and decodes every entity of `T`'s collection. Rows that no longer
/// decode are skipped with a warning rather than failing the whole load.
pub async fn load_entities<T: Entity>(store: &dyn LocalStore) -> Result<Vec<T>> {
    let rows = store.get_all(T::KIND).await?;
    let mut entities = Vec::with_capacity(rows.len());
    for row in rows {
        match serde_json::from_value::<T>(row) {
            Ok(entity) => entities.push(entity),
            Err(err) => log::warn!(
                "[LocalStore] Skipping undecodable {} row: {}",
                T::KIND,
                err
            ),
        }
    }
    Ok(entities)
}

/// Serializes and upserts one entity.
pub async fn put_entity<T: Entity>(store: &dyn LocalStore, entity: &T) -> Result<()> {
    let value = serde_json::to_value(entity)?;
    store.put(T::KIND, entity.id(), value).await
}
