use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use tripsync_core::models::EntityKind;
use tripsync_core::sync::DirtyItem;

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::dirty_items)]
#[diesel(primary_key(user_id, collection, entity_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DirtyItemDB {
    pub user_id: String,
    pub collection: String,
    pub entity_id: String,
    pub position: i64,
    pub marked_at: String,
}

impl DirtyItemDB {
    pub fn new(user_id: &str, item: &DirtyItem, position: i64, marked_at: String) -> Self {
        Self {
            user_id: user_id.to_string(),
            collection: item.collection.collection_name().to_string(),
            entity_id: item.id.clone(),
            position,
            marked_at,
        }
    }

    /// `None` when the stored collection name is no longer known.
    pub fn into_item(self) -> Option<DirtyItem> {
        EntityKind::from_collection_name(&self.collection)
            .map(|kind| DirtyItem::new(self.entity_id, kind))
    }
}
