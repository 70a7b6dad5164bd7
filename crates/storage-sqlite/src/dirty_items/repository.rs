use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::SqliteConnection;
use log::warn;

use tripsync_core::errors::Result;
use tripsync_core::store::DirtyItemStore;
use tripsync_core::sync::DirtyItem;

use super::model::DirtyItemDB;
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::dirty_items;

/// Durable dirty queue, partitioned by user and ordered by first mark.
pub struct DirtyItemRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl DirtyItemRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        DirtyItemRepository { pool, writer }
    }
}

#[async_trait]
impl DirtyItemStore for DirtyItemRepository {
    async fn load_dirty_items(&self, user_id: &str) -> Result<Vec<DirtyItem>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = dirty_items::table
            .filter(dirty_items::user_id.eq(user_id))
            .order(dirty_items::position.asc())
            .select(DirtyItemDB::as_select())
            .load::<DirtyItemDB>(&mut conn)
            .map_err(StorageError::from)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let collection = row.collection.clone();
            match row.into_item() {
                Some(item) => items.push(item),
                None => warn!(
                    "[LocalStore] Ignoring dirty item in unknown collection '{}'",
                    collection
                ),
            }
        }
        Ok(items)
    }

    async fn save_dirty_item(&self, user_id: &str, item: DirtyItem) -> Result<()> {
        let user_id = user_id.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                let last = dirty_items::table
                    .filter(dirty_items::user_id.eq(&user_id))
                    .select(max(dirty_items::position))
                    .first::<Option<i64>>(conn)
                    .map_err(StorageError::from)?;
                let row = DirtyItemDB::new(
                    &user_id,
                    &item,
                    last.unwrap_or(0) + 1,
                    Utc::now().to_rfc3339(),
                );
                diesel::insert_into(dirty_items::table)
                    .values(&row)
                    .on_conflict((
                        dirty_items::user_id,
                        dirty_items::collection,
                        dirty_items::entity_id,
                    ))
                    .do_nothing()
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn remove_dirty_items(&self, user_id: &str, items: Vec<DirtyItem>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let user_id = user_id.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                for item in items {
                    diesel::delete(
                        dirty_items::table
                            .filter(dirty_items::user_id.eq(&user_id))
                            .filter(dirty_items::collection.eq(item.collection.collection_name()))
                            .filter(dirty_items::entity_id.eq(&item.id)),
                    )
                    .execute(conn)
                    .map_err(StorageError::from)?;
                }
                Ok(())
            })
            .await
    }

    async fn clear_dirty_items(&self, user_id: &str) -> Result<()> {
        let user_id = user_id.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                diesel::delete(dirty_items::table.filter(dirty_items::user_id.eq(user_id)))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }
}
