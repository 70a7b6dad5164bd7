use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::SqliteConnection;
use log::warn;

use tripsync_core::errors::{Error, Result};
use tripsync_core::models::EntityKind;
use tripsync_core::store::LocalStore;

use super::model::MetaDB;
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::meta;

/// Expands `$body` once per local collection table, with `$t` bound to the
/// table's schema module. Kinds without a local table return an error.
macro_rules! with_collection {
    ($kind:expr, $t:ident => $body:expr) => {
        match $kind {
            EntityKind::Trip => {
                use crate::schema::trips as $t;
                $body
            }
            EntityKind::Dashboard => {
                use crate::schema::dashboards as $t;
                $body
            }
            EntityKind::Card => {
                use crate::schema::cards as $t;
                $body
            }
            EntityKind::Settings => {
                use crate::schema::settings as $t;
                $body
            }
            other @ (EntityKind::Group | EntityKind::Expense) => {
                return Err(Error::invalid_input(format!(
                    "'{}' has no local collection",
                    other
                )));
            }
        }
    };
}

/// SQLite-backed [`LocalStore`]: one table per collection holding the
/// entity's JSON document, plus the `meta` key-value table.
pub struct LocalEntityRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl LocalEntityRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        LocalEntityRepository { pool, writer }
    }

    fn load_rows(&self, kind: EntityKind) -> Result<Vec<(String, String)>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = with_collection!(kind, t => t::table
            .select((t::id, t::data))
            .order(t::id.asc())
            .load::<(String, String)>(&mut conn)
            .map_err(StorageError::from)?);
        Ok(rows)
    }
}

fn clear_collections(conn: &mut SqliteConnection) -> Result<usize> {
    use crate::schema::{cards, dashboards, settings, trips};

    let mut removed = 0;
    removed += diesel::delete(cards::table)
        .execute(conn)
        .map_err(StorageError::from)?;
    removed += diesel::delete(dashboards::table)
        .execute(conn)
        .map_err(StorageError::from)?;
    removed += diesel::delete(trips::table)
        .execute(conn)
        .map_err(StorageError::from)?;
    removed += diesel::delete(settings::table)
        .execute(conn)
        .map_err(StorageError::from)?;
    removed += diesel::delete(meta::table)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(removed)
}

#[async_trait]
impl LocalStore for LocalEntityRepository {
    async fn get_all(&self, kind: EntityKind) -> Result<Vec<serde_json::Value>> {
        let rows = self.load_rows(kind)?;
        let mut values = Vec::with_capacity(rows.len());
        for (row_id, data) in rows {
            match serde_json::from_str(&data) {
                Ok(value) => values.push(value),
                Err(err) => warn!(
                    "[LocalStore] Skipping corrupt {} row {}: {}",
                    kind, row_id, err
                ),
            }
        }
        Ok(values)
    }

    async fn put(&self, kind: EntityKind, id: &str, value: serde_json::Value) -> Result<()> {
        let row_id = id.to_string();
        let data = serde_json::to_string(&value)?;
        let now = Utc::now().to_rfc3339();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                with_collection!(kind, t => {
                    diesel::insert_into(t::table)
                        .values((t::id.eq(&row_id), t::data.eq(&data), t::updated_at.eq(&now)))
                        .on_conflict(t::id)
                        .do_update()
                        .set((t::data.eq(&data), t::updated_at.eq(&now)))
                        .execute(conn)
                        .map_err(StorageError::from)?;
                });
                Ok(())
            })
            .await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        let row_id = id.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                with_collection!(kind, t => {
                    diesel::delete(t::table.find(row_id))
                        .execute(conn)
                        .map_err(StorageError::from)?;
                });
                Ok(())
            })
            .await
    }

    async fn clear_all(&self) -> Result<()> {
        let removed = self
            .writer
            .exec(|conn: &mut SqliteConnection| -> Result<usize> { clear_collections(conn) })
            .await?;
        log::info!("[LocalStore] Cleared {} local row(s)", removed);
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let mut conn = get_connection(&self.pool)?;
        let value = meta::table
            .find(key)
            .select(meta::value)
            .first::<String>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(value)
    }

    async fn set_meta(&self, key: &str, value: Option<String>) -> Result<()> {
        let key = key.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                match value {
                    Some(value) => {
                        let row = MetaDB::new(key, value);
                        diesel::insert_into(meta::table)
                            .values(&row)
                            .on_conflict(meta::key)
                            .do_update()
                            .set(&row)
                            .execute(conn)
                            .map_err(StorageError::from)?;
                    }
                    None => {
                        diesel::delete(meta::table.find(key))
                            .execute(conn)
                            .map_err(StorageError::from)?;
                    }
                }
                Ok(())
            })
            .await
    }
}
