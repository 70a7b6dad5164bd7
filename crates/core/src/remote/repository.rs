//! Remote storage shapes.
//!
//! Two layouts coexist in the remote database. Single-user data pushed by
//! the reconciliation engine lives under `users/{uid}/{collection}/{id}`.
//! Collaborative data lives in the trip tree rooted at `trips/{tripId}`.
//! Both are reached through [`RemoteRepository`].

use std::sync::Arc;

use async_trait::async_trait;

use super::{
    CollectionPath, DocumentPatch, DocumentPath, DocumentStore, Filter, Listener, Query,
};
use crate::errors::{Error, Result};
use crate::models::{EntityKind, RecordKey};

const USERS_COLLECTION: &str = "users";

/// A collection addressed by its kind and the parent ids that place it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionScope {
    pub kind: EntityKind,
    pub trip_id: Option<String>,
    pub dashboard_id: Option<String>,
}

impl CollectionScope {
    pub fn of(kind: EntityKind) -> Self {
        Self {
            kind,
            trip_id: None,
            dashboard_id: None,
        }
    }

    pub fn in_trip(mut self, trip_id: impl Into<String>) -> Self {
        self.trip_id = Some(trip_id.into());
        self
    }

    pub fn in_dashboard(mut self, dashboard_id: impl Into<String>) -> Self {
        self.dashboard_id = Some(dashboard_id.into());
        self
    }
}

impl From<&RecordKey> for CollectionScope {
    fn from(key: &RecordKey) -> Self {
        Self {
            kind: key.kind,
            trip_id: key.trip_id.clone(),
            dashboard_id: key.dashboard_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    /// `users/{uid}/{collection}/{id}`
    UserScoped,
    /// `trips/{tripId}/...`
    TripTree,
}

impl RemoteMode {
    /// Picks the layout for an entity. Groups and expenses only exist in the
    /// trip tree, settings only in the user namespace; the rest follow the
    /// trip tree once shared.
    pub fn for_entity(kind: EntityKind, shared: bool) -> Self {
        match kind {
            EntityKind::Group | EntityKind::Expense => RemoteMode::TripTree,
            EntityKind::Settings => RemoteMode::UserScoped,
            EntityKind::Trip | EntityKind::Dashboard | EntityKind::Card => {
                if shared {
                    RemoteMode::TripTree
                } else {
                    RemoteMode::UserScoped
                }
            }
        }
    }
}

#[async_trait]
pub trait RemoteRepository: Send + Sync {
    fn mode(&self) -> RemoteMode;

    fn document_path(&self, key: &RecordKey) -> Result<DocumentPath>;

    fn collection_path(&self, scope: &CollectionScope) -> Result<CollectionPath>;

    async fn save(&self, key: &RecordKey, patch: DocumentPatch) -> Result<()>;

    async fn delete(&self, key: &RecordKey) -> Result<()>;

    /// Live listener over one scoped collection, narrowed by `filters`.
    async fn subscribe(&self, scope: &CollectionScope, filters: Vec<Filter>) -> Result<Listener>;
}

pub struct UserScopedRepository {
    store: Arc<dyn DocumentStore>,
    user_id: String,
}

impl UserScopedRepository {
    pub fn new(store: Arc<dyn DocumentStore>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

#[async_trait]
impl RemoteRepository for UserScopedRepository {
    fn mode(&self) -> RemoteMode {
        RemoteMode::UserScoped
    }

    fn document_path(&self, key: &RecordKey) -> Result<DocumentPath> {
        self.collection_path(&CollectionScope::of(key.kind))?
            .doc(&key.id)
    }

    fn collection_path(&self, scope: &CollectionScope) -> Result<CollectionPath> {
        CollectionPath::root(USERS_COLLECTION)?
            .doc(&self.user_id)?
            .collection(scope.kind.collection_name())
    }

    async fn save(&self, key: &RecordKey, patch: DocumentPatch) -> Result<()> {
        let path = self.document_path(key)?;
        self.store.set_merge(&path, patch).await
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        let path = self.document_path(key)?;
        self.store.delete(&path).await
    }

    async fn subscribe(&self, scope: &CollectionScope, filters: Vec<Filter>) -> Result<Listener> {
        let query = filters
            .into_iter()
            .fold(Query::all(self.collection_path(scope)?), Query::filter);
        self.store.listen(query).await
    }
}

pub struct TripTreeRepository {
    store: Arc<dyn DocumentStore>,
}

fn require<'a>(value: &'a Option<String>, what: &str, kind: EntityKind) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| Error::invalid_input(format!("{} requires a {} in the trip tree", kind, what)))
}

impl TripTreeRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn trip_path(&self, trip_id: &str) -> Result<DocumentPath> {
        CollectionPath::root(EntityKind::Trip.collection_name())?.doc(trip_id)
    }
}

#[async_trait]
impl RemoteRepository for TripTreeRepository {
    fn mode(&self) -> RemoteMode {
        RemoteMode::TripTree
    }

    fn document_path(&self, key: &RecordKey) -> Result<DocumentPath> {
        if key.kind == EntityKind::Trip {
            return self.trip_path(&key.id);
        }
        self.collection_path(&CollectionScope::from(key))?
            .doc(&key.id)
    }

    fn collection_path(&self, scope: &CollectionScope) -> Result<CollectionPath> {
        let kind = scope.kind;
        match kind {
            EntityKind::Trip => CollectionPath::root(kind.collection_name()),
            EntityKind::Dashboard | EntityKind::Card | EntityKind::Expense => {
                let trip_id = require(&scope.trip_id, "trip id", kind)?;
                self.trip_path(trip_id)?.collection(kind.collection_name())
            }
            EntityKind::Group => {
                let trip_id = require(&scope.trip_id, "trip id", kind)?;
                let dashboard_id = require(&scope.dashboard_id, "dashboard id", kind)?;
                self.trip_path(trip_id)?
                    .collection(EntityKind::Dashboard.collection_name())?
                    .doc(dashboard_id)?
                    .collection(kind.collection_name())
            }
            EntityKind::Settings => Err(Error::invalid_input(
                "settings are not stored in the trip tree",
            )),
        }
    }

    async fn save(&self, key: &RecordKey, patch: DocumentPatch) -> Result<()> {
        let path = self.document_path(key)?;
        self.store.set_merge(&path, patch).await
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        let path = self.document_path(key)?;
        self.store.delete(&path).await
    }

    async fn subscribe(&self, scope: &CollectionScope, filters: Vec<Filter>) -> Result<Listener> {
        let query = filters
            .into_iter()
            .fold(Query::all(self.collection_path(scope)?), Query::filter);
        self.store.listen(query).await
    }
}

/// Builds the repository for `mode`. The user id is only used by the
/// user-scoped layout.
pub fn repository_for(
    mode: RemoteMode,
    store: Arc<dyn DocumentStore>,
    user_id: &str,
) -> Arc<dyn RemoteRepository> {
    match mode {
        RemoteMode::UserScoped => Arc::new(UserScopedRepository::new(store, user_id)),
        RemoteMode::TripTree => Arc::new(TripTreeRepository::new(store)),
    }
}
