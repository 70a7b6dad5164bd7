//! Local-first mutation API consumed by every UI surface.
//!
//! Each operation updates in-memory state, marks the entity dirty and
//! writes the local store. The remote push happens later, in the
//! reconciliation engine.

use std::sync::Arc;

use log::debug;

use crate::errors::{Error, Result};
use crate::models::{AccountSettings, Card, Dashboard, Entity, EntityKind, Trip};
use crate::state::{read_state, write_state, AppState, SharedState};
use crate::store::{put_entity, LocalStore, META_ACTIVE_TRIP_ID};
use crate::sync::ReconciliationEngine;

pub struct EntityOperations {
    state: SharedState,
    local: Arc<dyn LocalStore>,
    engine: Arc<ReconciliationEngine>,
}

impl EntityOperations {
    pub fn new(
        state: SharedState,
        local: Arc<dyn LocalStore>,
        engine: Arc<ReconciliationEngine>,
    ) -> Self {
        Self {
            state,
            local,
            engine,
        }
    }

    /// The dirty item is recorded before the local write so a failed write
    /// still reaches the remote store on the next pass.
    async fn commit_upsert<T: Entity>(
        &self,
        entity: &T,
        apply: impl FnOnce(&mut AppState),
    ) -> Result<()> {
        apply(&mut *write_state(&self.state)?);
        self.engine.mark_dirty(entity.id(), T::KIND).await?;
        put_entity(self.local.as_ref(), entity).await
    }

    async fn commit_removals(&self, removed: Vec<(EntityKind, String)>) -> Result<usize> {
        for (kind, id) in &removed {
            self.engine.mark_dirty(id, *kind).await?;
            self.local.delete(*kind, id).await?;
        }
        Ok(removed.len())
    }

    fn require<T: Entity>(&self, exists: impl FnOnce(&AppState) -> bool, id: &str) -> Result<()> {
        if exists(&*read_state(&self.state)?) {
            return Ok(());
        }
        Err(Error::NotFound(format!("{} {}", T::KIND, id)))
    }

    pub async fn add_card(&self, card: Card) -> Result<Card> {
        let stored = card.clone();
        self.commit_upsert(&card, |state| {
            state.cards.insert(stored);
        })
        .await?;
        Ok(card)
    }

    pub async fn update_card(&self, card: Card) -> Result<Card> {
        self.require::<Card>(|s| s.cards.contains(&card.id), &card.id)?;
        self.add_card(card).await
    }

    pub async fn delete_card(&self, card_id: &str) -> Result<()> {
        self.require::<Card>(|s| s.cards.contains(card_id), card_id)?;
        write_state(&self.state)?.cards.remove(card_id);
        self.commit_removals(vec![(EntityKind::Card, card_id.to_string())])
            .await?;
        Ok(())
    }

    pub async fn add_trip(&self, trip: Trip) -> Result<Trip> {
        let stored = trip.clone();
        self.commit_upsert(&trip, |state| {
            state.trips.insert(stored);
        })
        .await?;
        Ok(trip)
    }

    pub async fn update_trip(&self, trip: Trip) -> Result<Trip> {
        self.require::<Trip>(|s| s.trips.contains(&trip.id), &trip.id)?;
        self.add_trip(trip).await
    }

    /// Removes the trip, its dashboards and their cards. Returns how many
    /// entities were removed.
    pub async fn delete_trip(&self, trip_id: &str) -> Result<usize> {
        self.require::<Trip>(|s| s.trips.contains(trip_id), trip_id)?;
        let removed = {
            let mut state = write_state(&self.state)?;
            state.trips.remove(trip_id);
            let dashboards = state.dashboards.remove_where(|d| d.trip_id == trip_id);
            let cards = state
                .cards
                .remove_where(|c| dashboards.iter().any(|d| d.id == c.dashboard_id));
            if state.active_trip_id.as_deref() == Some(trip_id) {
                state.active_trip_id = None;
            }

            let mut removed = vec![(EntityKind::Trip, trip_id.to_string())];
            removed.extend(dashboards.into_iter().map(|d| (EntityKind::Dashboard, d.id)));
            removed.extend(cards.into_iter().map(|c| (EntityKind::Card, c.id)));
            removed
        };
        debug!(
            "[Operations] Deleting trip {} removes {} entities",
            trip_id,
            removed.len()
        );
        self.commit_removals(removed).await
    }

    pub async fn add_dashboard(&self, dashboard: Dashboard) -> Result<Dashboard> {
        let stored = dashboard.clone();
        self.commit_upsert(&dashboard, |state| {
            state.dashboards.insert(stored);
        })
        .await?;
        Ok(dashboard)
    }

    pub async fn update_dashboard(&self, dashboard: Dashboard) -> Result<Dashboard> {
        self.require::<Dashboard>(|s| s.dashboards.contains(&dashboard.id), &dashboard.id)?;
        self.add_dashboard(dashboard).await
    }

    /// Removes the dashboard and its cards.
    pub async fn delete_dashboard(&self, dashboard_id: &str) -> Result<usize> {
        self.require::<Dashboard>(|s| s.dashboards.contains(dashboard_id), dashboard_id)?;
        let removed = {
            let mut state = write_state(&self.state)?;
            state.dashboards.remove(dashboard_id);
            let cards = state.cards.remove_where(|c| c.dashboard_id == dashboard_id);
            let mut removed = vec![(EntityKind::Dashboard, dashboard_id.to_string())];
            removed.extend(cards.into_iter().map(|c| (EntityKind::Card, c.id)));
            removed
        };
        self.commit_removals(removed).await
    }

    pub async fn update_settings(&self, settings: AccountSettings) -> Result<AccountSettings> {
        let stored = settings.clone();
        self.commit_upsert(&settings, |state| state.settings = Some(stored))
            .await?;
        Ok(settings)
    }

    /// Remembers the open trip across restarts. Not synchronized.
    pub async fn set_active_trip(&self, trip_id: Option<&str>) -> Result<()> {
        if let Some(id) = trip_id {
            self.require::<Trip>(|s| s.trips.contains(id), id)?;
        }
        write_state(&self.state)?.active_trip_id = trip_id.map(str::to_string);
        self.local
            .set_meta(META_ACTIVE_TRIP_ID, trip_id.map(str::to_string))
            .await
    }

    pub fn settings(&self) -> Result<AccountSettings> {
        Ok(read_state(&self.state)?
            .settings
            .clone()
            .unwrap_or_default())
    }
}
