//! Authenticated sync session: owns every piece of sync state for one
//! signed-in user, from `start` until `teardown` or `logout`.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::config::SyncConfig;
use crate::errors::{Error, Result};
use crate::models::{AccountSettings, Card, Dashboard, Trip};
use crate::operations::EntityOperations;
use crate::remote::{repository_for, DocumentStore, RemoteMode};
use crate::state::{new_shared_state, write_state, SharedState};
use crate::store::{load_entities, DirtyItemStore, LocalStore, META_ACTIVE_TRIP_ID};
use crate::subscription::TripSubscriptionManager;
use crate::sync::{
    ConnectivityMonitor, DirtyQueue, ReconcileReport, ReconciliationEngine, SyncScheduler,
    SyncStatus,
};

/// Identity supplied by the authentication provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: String,
    pub email: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
        }
    }
}

/// External collaborators a session is built from.
pub struct SessionBackends {
    pub local: Arc<dyn LocalStore>,
    pub dirty_items: Arc<dyn DirtyItemStore>,
    pub remote: Arc<dyn DocumentStore>,
    pub connectivity: Arc<ConnectivityMonitor>,
}

/// Reads every local collection into a fresh state.
pub async fn load_local_state(local: &dyn LocalStore, state: &SharedState) -> Result<()> {
    let trips = load_entities::<Trip>(local).await?;
    let dashboards = load_entities::<Dashboard>(local).await?;
    let cards = load_entities::<Card>(local).await?;
    let settings = load_entities::<AccountSettings>(local).await?;
    let active_trip_id = local.get_meta(META_ACTIVE_TRIP_ID).await?;

    let mut app = write_state(state)?;
    app.clear();
    for trip in trips {
        app.trips.insert(trip);
    }
    for dashboard in dashboards {
        app.dashboards.insert(dashboard);
    }
    for card in cards {
        app.cards.insert(card);
    }
    app.settings = settings.into_iter().next();
    app.active_trip_id = active_trip_id;
    Ok(())
}

pub struct SyncSession {
    identity: SessionIdentity,
    state: SharedState,
    local: Arc<dyn LocalStore>,
    engine: Arc<ReconciliationEngine>,
    scheduler: SyncScheduler,
    subscriptions: TripSubscriptionManager,
    operations: EntityOperations,
}

impl SyncSession {
    /// Loads local state, restores the user's persisted dirty items, starts
    /// the background engine and follows the user's trips.
    ///
    /// Failing to open remote listeners does not fail the session; local
    /// work continues and [`resubscribe`](Self::resubscribe) can retry.
    pub async fn start(
        identity: SessionIdentity,
        config: &SyncConfig,
        backends: SessionBackends,
    ) -> Result<Self> {
        if identity.user_id.trim().is_empty() {
            return Err(Error::NotAuthenticated);
        }
        let SessionBackends {
            local,
            dirty_items,
            remote,
            connectivity,
        } = backends;

        let state = new_shared_state();
        load_local_state(local.as_ref(), &state).await?;

        let queue = Arc::new(DirtyQueue::new(dirty_items, identity.user_id.clone()));
        let restored = queue.restore().await?;

        let engine = Arc::new(
            ReconciliationEngine::new(
                state.clone(),
                Arc::clone(&queue),
                connectivity,
                repository_for(RemoteMode::UserScoped, Arc::clone(&remote), &identity.user_id),
                config.dirty_threshold,
            )
            .with_trip_tree(repository_for(
                RemoteMode::TripTree,
                Arc::clone(&remote),
                &identity.user_id,
            )),
        );
        let scheduler = SyncScheduler::new(
            Arc::clone(&engine),
            Duration::from_secs(config.sync_interval_secs.max(1)),
        );
        scheduler.ensure_started().await;

        let subscriptions = TripSubscriptionManager::new(
            remote,
            state.clone(),
            identity.user_id.clone(),
            identity.email.clone(),
            config.batch_write_limit,
            Some(queue),
        );
        if let Err(err) = subscriptions.start().await {
            warn!("[Session] Trip subscriptions unavailable: {}", err);
        }

        let operations =
            EntityOperations::new(state.clone(), Arc::clone(&local), Arc::clone(&engine));
        info!(
            "[Session] Started for user {} with {} restored pending change(s)",
            identity.user_id, restored
        );
        Ok(Self {
            identity,
            state,
            local,
            engine,
            scheduler,
            subscriptions,
            operations,
        })
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn operations(&self) -> &EntityOperations {
        &self.operations
    }

    pub fn subscriptions(&self) -> &TripSubscriptionManager {
        &self.subscriptions
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn status(&self) -> SyncStatus {
        self.engine.status()
    }

    /// User-initiated sync.
    pub async fn force_sync(&self) -> Result<ReconcileReport> {
        self.engine.force_sync().await
    }

    pub async fn resubscribe(&self) -> Result<()> {
        self.subscriptions.start().await
    }

    /// Stops background work and cancels every listener. Local data and
    /// pending changes are kept.
    pub async fn teardown(&self) -> Result<()> {
        self.scheduler.ensure_stopped().await;
        let cancelled = self.subscriptions.stop()?;
        info!(
            "[Session] Torn down for user {} ({} listener(s) cancelled)",
            self.identity.user_id, cancelled
        );
        Ok(())
    }

    /// Tears down, then wipes local data and this user's pending changes.
    pub async fn logout(self) -> Result<()> {
        self.teardown().await?;
        self.local.clear_all().await?;
        self.engine.queue().clear().await?;
        write_state(&self.state)?.clear();
        self.engine.publish_status();
        info!("[Session] Logged out user {}", self.identity.user_id);
        Ok(())
    }
}
