//! In-memory application state shared by the local mutation path and the
//! remote subscription path.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::errors::{Error, Result};
use crate::models::{
    AccountSettings, Card, Dashboard, Entity, EntityKind, Expense, Group, Trip,
    ACCOUNT_SETTINGS_ID,
};

/// Entities of one kind keyed by id.
#[derive(Debug, Clone)]
pub struct EntityMap<T: Entity> {
    items: BTreeMap<String, T>,
}

impl<T: Entity> Default for EntityMap<T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<T: Entity> EntityMap<T> {
    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn insert(&mut self, entity: T) -> Option<T> {
        self.items.insert(entity.id().to_string(), entity)
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.items.remove(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replaces exactly the entities selected by `in_scope` with `items`.
    /// Entities outside the scope are left untouched.
    pub fn replace_scope(&mut self, in_scope: impl Fn(&T) -> bool, items: Vec<T>) {
        self.items.retain(|_, entity| !in_scope(entity));
        for entity in items {
            self.insert(entity);
        }
    }

    pub fn remove_where(&mut self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        let ids: Vec<String> = self
            .items
            .iter()
            .filter(|(_, entity)| predicate(entity))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.items.remove(&id))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct AppState {
    pub trips: EntityMap<Trip>,
    pub dashboards: EntityMap<Dashboard>,
    pub groups: EntityMap<Group>,
    pub cards: EntityMap<Card>,
    pub expenses: EntityMap<Expense>,
    pub settings: Option<AccountSettings>,
    pub active_trip_id: Option<String>,
}

impl AppState {
    /// Current serialized value of an entity, or `None` when it no longer
    /// exists in live state.
    pub fn lookup_value(&self, kind: EntityKind, id: &str) -> Result<Option<serde_json::Value>> {
        let value = match kind {
            EntityKind::Trip => self.trips.get(id).map(serde_json::to_value),
            EntityKind::Dashboard => self.dashboards.get(id).map(serde_json::to_value),
            EntityKind::Group => self.groups.get(id).map(serde_json::to_value),
            EntityKind::Card => self.cards.get(id).map(serde_json::to_value),
            EntityKind::Expense => self.expenses.get(id).map(serde_json::to_value),
            EntityKind::Settings => self
                .settings
                .as_ref()
                .filter(|_| id == ACCOUNT_SETTINGS_ID)
                .map(serde_json::to_value),
        };
        Ok(value.transpose()?)
    }

    /// Whether a locally owned entity has moved into a shared trip tree:
    /// a trip with collaborators, a dashboard of such a trip, or a card
    /// placed in a trip.
    pub fn in_shared_tree(&self, kind: EntityKind, id: &str) -> bool {
        let shared_trip = |trip_id: &str| {
            self.trips
                .get(trip_id)
                .is_some_and(|trip| !trip.collaborators.is_empty())
        };
        match kind {
            EntityKind::Trip => shared_trip(id),
            EntityKind::Dashboard => self
                .dashboards
                .get(id)
                .is_some_and(|dashboard| shared_trip(&dashboard.trip_id)),
            EntityKind::Card => self.cards.get(id).is_some_and(|card| card.trip_id.is_some()),
            EntityKind::Group | EntityKind::Expense | EntityKind::Settings => false,
        }
    }

    /// Removes every trip-tree entity belonging to `trip_id`.
    pub fn remove_trip_tree(&mut self, trip_id: &str) {
        self.trips.remove(trip_id);
        let dashboards = self.dashboards.remove_where(|d| d.trip_id == trip_id);
        self.groups.remove_where(|g| g.trip_id == trip_id);
        self.cards.remove_where(|c| {
            c.trip_id.as_deref() == Some(trip_id)
                || dashboards.iter().any(|d| d.id == c.dashboard_id)
        });
        self.expenses.remove_where(|e| e.trip_id == trip_id);
        if self.active_trip_id.as_deref() == Some(trip_id) {
            self.active_trip_id = None;
        }
    }

    pub fn clear(&mut self) {
        *self = AppState::default();
    }
}

/// Handle to the state shared between tasks. Guards must never be held
/// across an await point.
pub type SharedState = Arc<RwLock<AppState>>;

pub fn new_shared_state() -> SharedState {
    Arc::new(RwLock::new(AppState::default()))
}

pub fn read_state(state: &SharedState) -> Result<RwLockReadGuard<'_, AppState>> {
    state
        .read()
        .map_err(|_| Error::Unexpected("Application state lock is poisoned".to_string()))
}

pub fn write_state(state: &SharedState) -> Result<RwLockWriteGuard<'_, AppState>> {
    state
        .write()
        .map_err(|_| Error::Unexpected("Application state lock is poisoned".to_string()))
}
