//! Device-local persistence for tripsync on SQLite via diesel.
//!
//! [`open`] prepares the database file and returns the two stores a
//! [`tripsync_core::SyncSession`] needs.

pub mod db;
pub mod dirty_items;
pub mod entities;
pub mod errors;
pub mod schema;

use std::sync::Arc;

use tripsync_core::Result;

pub use db::{create_pool, get_connection, init, run_migrations, spawn_writer, DbPool, WriteHandle};
pub use dirty_items::DirtyItemRepository;
pub use entities::LocalEntityRepository;
pub use errors::StorageError;

/// Both local stores backed by one database file.
pub struct SqliteStores {
    pub local: Arc<LocalEntityRepository>,
    pub dirty_items: Arc<DirtyItemRepository>,
}

/// Opens (creating and migrating when needed) the database at `db_path`.
pub fn open(db_path: &str) -> Result<SqliteStores> {
    let pool = init(db_path)?;
    let writer = spawn_writer(Arc::clone(&pool))?;
    Ok(SqliteStores {
        local: Arc::new(LocalEntityRepository::new(Arc::clone(&pool), writer.clone())),
        dirty_items: Arc::new(DirtyItemRepository::new(pool, writer)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tripsync_core::models::{Card, EntityKind};
    use tripsync_core::store::{load_entities, put_entity, DirtyItemStore, LocalStore};
    use tripsync_core::sync::DirtyItem;

    #[tokio::test]
    async fn data_survives_reopening_the_file() {
        let path = db::test_support::temp_db_path("reopen");
        let card = Card::new("d1", "Fado night");
        {
            let stores = open(&path).expect("open");
            put_entity(stores.local.as_ref(), &card).await.expect("card");
            stores
                .dirty_items
                .save_dirty_item("u1", DirtyItem::new(&card.id, EntityKind::Card))
                .await
                .expect("dirty");
        }

        let stores = open(&path).expect("reopen");
        let cards: Vec<Card> = load_entities(stores.local.as_ref()).await.expect("cards");
        assert_eq!(cards, vec![card.clone()]);
        assert_eq!(
            stores.dirty_items.load_dirty_items("u1").await.expect("dirty"),
            vec![DirtyItem::new(&card.id, EntityKind::Card)]
        );
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn pending_changes_survive_a_restart_and_sync_later() {
        use tripsync_core::remote::{DocumentPath, MemoryDocumentStore};
        use tripsync_core::sync::{ConnectivityMonitor, ReconcileStatus};
        use tripsync_core::{SessionBackends, SessionIdentity, SyncConfig, SyncSession};

        let path = db::test_support::temp_db_path("session");
        let remote = Arc::new(MemoryDocumentStore::new());
        let backends = |online: bool| -> SessionBackends {
            let stores = open(&path).expect("open");
            SessionBackends {
                local: stores.local,
                dirty_items: stores.dirty_items,
                remote: remote.clone(),
                connectivity: Arc::new(ConnectivityMonitor::new(online)),
            }
        };
        let identity = SessionIdentity::new("u1", "ana@example.com");
        let config = SyncConfig::default();

        let card = {
            let session = SyncSession::start(identity.clone(), &config, backends(false))
                .await
                .expect("offline session");
            let card = session
                .operations()
                .add_card(Card::new("d1", "Belem tower"))
                .await
                .expect("card");
            session.teardown().await.expect("teardown");
            card
        };

        let session = SyncSession::start(identity, &config, backends(true))
            .await
            .expect("online session");
        assert_eq!(session.status().pending_changes, 1);

        let report = session.force_sync().await.expect("sync");
        assert_eq!(report.status, ReconcileStatus::Completed);
        let doc_path =
            DocumentPath::parse(&format!("users/u1/cards/{}", card.id)).expect("path");
        let fields = remote
            .document_fields(&doc_path)
            .expect("fields")
            .expect("pushed card");
        assert_eq!(fields["title"], serde_json::json!("Belem tower"));

        session.logout().await.expect("logout");
        let stores = open(&path).expect("reopen");
        assert!(stores.local.get_all(EntityKind::Card).await.expect("cards").is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
