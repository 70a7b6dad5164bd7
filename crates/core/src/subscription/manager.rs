//! Trip subscriptions and direct trip-tree writes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use log::{debug, info, warn};

use super::decode_documents;
use super::tree::{SubscriptionHandle, SubscriptionTree};
use crate::errors::{Error, Result};
use crate::models::{
    AccountSettings, Card, Dashboard, Entity, EntityKind, Expense, Group, RecordKey, Trip,
    ACCOUNT_SETTINGS_ID,
};
use crate::remote::{
    CollectionScope, DocumentPatch, DocumentPath, DocumentStore, Filter, Listener, Query,
    QuerySnapshot, RemoteRepository, TripTreeRepository, UserScopedRepository, WriteBatch,
};
use crate::state::{read_state, write_state, SharedState};
use crate::sync::DirtyQueue;

/// Lifecycle of one observed trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripPhase {
    Unsubscribed,
    /// Observed, but child listeners are not attached yet. Trips whose
    /// creation is still unacknowledged stay here.
    Subscribing,
    Live,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservedTrip {
    pub trip: Trip,
    pub has_pending_writes: bool,
}

/// Merges the owned and shared result sets by trip id. When a trip appears
/// in both, the owned value is kept.
pub fn merge_trip_sets(owned: &[ObservedTrip], shared: &[ObservedTrip]) -> Vec<ObservedTrip> {
    let mut merged: BTreeMap<String, ObservedTrip> = BTreeMap::new();
    for observed in owned.iter().chain(shared) {
        merged
            .entry(observed.trip.id.clone())
            .or_insert_with(|| observed.clone());
    }
    merged.into_values().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TripSource {
    Owned,
    Shared,
}

#[derive(Default)]
struct Tracking {
    owned: Vec<ObservedTrip>,
    shared: Vec<ObservedTrip>,
    phases: HashMap<String, TripPhase>,
    /// Trips and (trip, dashboard) pairs whose documents are being deleted.
    /// Snapshots never attach listeners under them.
    deleting_trips: HashSet<String>,
    deleting_dashboards: HashSet<(String, String)>,
}

struct Inner {
    user_id: String,
    email: String,
    trips: TripTreeRepository,
    account: UserScopedRepository,
    state: SharedState,
    queue: Option<Arc<DirtyQueue>>,
    batch_write_limit: usize,
    // Lock order: tracking, then tree.
    tracking: Mutex<Tracking>,
    tree: Mutex<SubscriptionTree>,
    roots: Mutex<Vec<SubscriptionHandle>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Unexpected(format!("{} lock is poisoned", what)))
}

/// Spawns a task applying every snapshot of `listener` through `on_snapshot`.
/// The task holds only a weak reference so a dropped manager ends it.
fn spawn_listener<F, Fut>(
    inner: &Arc<Inner>,
    listener: Listener,
    label: String,
    on_snapshot: F,
) -> SubscriptionHandle
where
    F: Fn(Arc<Inner>, QuerySnapshot) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let Listener {
        mut events,
        registration,
    } = listener;
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            match event {
                Ok(snapshot) => on_snapshot(inner, snapshot).await,
                Err(err) => warn!("[Subscriptions] Listener {} failed: {}", label, err),
            }
        }
        debug!("[Subscriptions] Listener {} closed", label);
    });
    SubscriptionHandle::new(registration, task)
}

impl Inner {
    fn owned_trip(&self, trip_id: &str) -> Result<Trip> {
        let trip = read_state(&self.state)?
            .trips
            .get(trip_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("trip {}", trip_id)))?;
        if !trip.is_owned_by(&self.user_id) {
            return Err(Error::PermissionDenied(format!(
                "only the owner can modify trip {}",
                trip_id
            )));
        }
        Ok(trip)
    }

    /// Fails unless the user may write into the trip's tree.
    fn editable_trip(&self, trip_id: &str) -> Result<Trip> {
        let trip = read_state(&self.state)?
            .trips
            .get(trip_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("trip {}", trip_id)))?;
        if !trip.can_edit(&self.user_id, &self.email) {
            return Err(Error::PermissionDenied(format!(
                "no edit access to trip {}",
                trip_id
            )));
        }
        Ok(trip)
    }

    fn begin_trip_delete(&self, trip_id: &str) -> Result<()> {
        let mut tracking = lock(&self.tracking, "Subscription tracking")?;
        tracking.deleting_trips.insert(trip_id.to_string());
        tracking.phases.remove(trip_id);
        lock(&self.tree, "Subscription tree")?.unsubscribe_subtree(&[trip_id]);
        Ok(())
    }

    /// Lifts the delete mark. A failed delete re-attaches the trip when it
    /// is still visible.
    async fn end_trip_delete(self: &Arc<Self>, trip_id: &str, deleted: bool) {
        let reattach = match lock(&self.tracking, "Subscription tracking") {
            Ok(mut tracking) => {
                tracking.deleting_trips.remove(trip_id);
                let visible = !deleted
                    && merge_trip_sets(&tracking.owned, &tracking.shared)
                        .iter()
                        .any(|o| o.trip.id == trip_id);
                if visible {
                    tracking
                        .phases
                        .insert(trip_id.to_string(), TripPhase::Live);
                }
                visible
            }
            Err(err) => {
                warn!("[Subscriptions] {}", err);
                false
            }
        };
        if reattach {
            self.attach_trip(trip_id).await;
        }
    }

    fn begin_dashboard_delete(&self, trip_id: &str, dashboard_id: &str) -> Result<()> {
        let mut tracking = lock(&self.tracking, "Subscription tracking")?;
        tracking
            .deleting_dashboards
            .insert((trip_id.to_string(), dashboard_id.to_string()));
        lock(&self.tree, "Subscription tree")?.unsubscribe_subtree(&[trip_id, dashboard_id]);
        Ok(())
    }

    async fn end_dashboard_delete(
        self: &Arc<Self>,
        trip_id: &str,
        dashboard_id: &str,
        deleted: bool,
    ) {
        let known = read_state(&self.state)
            .map(|state| state.dashboards.contains(dashboard_id))
            .unwrap_or(false);
        let reattach = {
            let (Ok(mut tracking), Ok(mut tree)) = (
                lock(&self.tracking, "Subscription tracking"),
                lock(&self.tree, "Subscription tree"),
            ) else {
                warn!("[Subscriptions] Lost dashboard {} after delete", dashboard_id);
                return;
            };
            tracking
                .deleting_dashboards
                .remove(&(trip_id.to_string(), dashboard_id.to_string()));
            !deleted
                && known
                && tree.contains(&[trip_id])
                && tree.reserve(&[trip_id, dashboard_id])
        };
        if reattach {
            self.attach_groups(trip_id, dashboard_id).await;
        }
    }

    /// Records a new result set from one trip query and returns the trips
    /// that disappeared and those ready for child listeners.
    fn track_trips(
        &self,
        source: TripSource,
        observed: Vec<ObservedTrip>,
    ) -> Result<(Vec<ObservedTrip>, Vec<String>, Vec<String>)> {
        let mut tracking = lock(&self.tracking, "Subscription tracking")?;
        match source {
            TripSource::Owned => tracking.owned = observed,
            TripSource::Shared => tracking.shared = observed,
        }
        let merged: Vec<ObservedTrip> = merge_trip_sets(&tracking.owned, &tracking.shared)
            .into_iter()
            .filter(|o| !tracking.deleting_trips.contains(&o.trip.id))
            .collect();
        let visible: HashSet<&str> = merged.iter().map(|o| o.trip.id.as_str()).collect();

        let removed: Vec<String> = tracking
            .phases
            .keys()
            .filter(|id| !visible.contains(id.as_str()))
            .cloned()
            .collect();
        for id in &removed {
            tracking.phases.remove(id);
        }

        let mut ready = Vec::new();
        for observed in &merged {
            let phase = tracking
                .phases
                .entry(observed.trip.id.clone())
                .or_insert(TripPhase::Subscribing);
            if *phase == TripPhase::Subscribing && !observed.has_pending_writes {
                *phase = TripPhase::Live;
                ready.push(observed.trip.id.clone());
            }
        }

        if !removed.is_empty() {
            let mut tree = lock(&self.tree, "Subscription tree")?;
            for id in &removed {
                let cancelled = tree.unsubscribe_subtree(&[id.as_str()]);
                debug!(
                    "[Subscriptions] Trip {} gone, cancelled {} listener(s)",
                    id, cancelled
                );
            }
        }
        Ok((merged, removed, ready))
    }

    async fn on_trips(self: Arc<Self>, source: TripSource, snapshot: QuerySnapshot) {
        let observed = decode_documents::<Trip>(&snapshot, &[])
            .into_iter()
            .map(|(trip, has_pending_writes)| ObservedTrip {
                trip,
                has_pending_writes,
            })
            .collect();
        let (merged, removed, ready) = match self.track_trips(source, observed) {
            Ok(result) => result,
            Err(err) => {
                warn!("[Subscriptions] Could not track trips: {}", err);
                return;
            }
        };

        match write_state(&self.state) {
            Ok(mut state) => {
                for id in &removed {
                    state.remove_trip_tree(id);
                }
                for observed in merged {
                    state.trips.insert(observed.trip);
                }
            }
            Err(err) => warn!("[Subscriptions] Could not apply trips: {}", err),
        }

        for trip_id in ready {
            self.attach_trip(&trip_id).await;
        }
    }

    async fn attach_trip(self: &Arc<Self>, trip_id: &str) {
        match lock(&self.tree, "Subscription tree") {
            Ok(mut tree) => {
                tree.reserve(&[trip_id]);
            }
            Err(err) => {
                warn!("[Subscriptions] {}", err);
                return;
            }
        }

        let result = self.subscribe_trip_children(trip_id).await;

        let (Ok(mut tracking), Ok(mut tree)) = (
            lock(&self.tracking, "Subscription tracking"),
            lock(&self.tree, "Subscription tree"),
        ) else {
            warn!("[Subscriptions] Lost trip {} while attaching", trip_id);
            return;
        };
        let still_live = tracking.phases.get(trip_id) == Some(&TripPhase::Live);
        match result {
            Ok(handles) if still_live => {
                for handle in handles {
                    tree.attach(&[trip_id], handle);
                }
                info!("[Subscriptions] Trip {} is live", trip_id);
            }
            Ok(handles) => {
                for handle in handles {
                    handle.cancel();
                }
            }
            Err(err) => {
                warn!(
                    "[Subscriptions] Could not subscribe to trip {}: {}",
                    trip_id, err
                );
                tree.unsubscribe_subtree(&[trip_id]);
                if let Some(phase) = tracking.phases.get_mut(trip_id) {
                    *phase = TripPhase::Subscribing;
                }
            }
        }
    }

    async fn subscribe_trip_children(
        self: &Arc<Self>,
        trip_id: &str,
    ) -> Result<Vec<SubscriptionHandle>> {
        let dashboards_scope = CollectionScope::of(EntityKind::Dashboard).in_trip(trip_id);
        let cards_scope = CollectionScope::of(EntityKind::Card).in_trip(trip_id);
        let expenses_scope = CollectionScope::of(EntityKind::Expense).in_trip(trip_id);
        let (dashboards, cards, expenses) = futures::try_join!(
            self.trips.subscribe(&dashboards_scope, Vec::new()),
            self.trips.subscribe(&cards_scope, Vec::new()),
            self.trips.subscribe(&expenses_scope, Vec::new()),
        )?;

        let id = trip_id.to_string();
        let dashboards = spawn_listener(
            self,
            dashboards,
            format!("trips/{}/dashboards", trip_id),
            move |inner, snapshot| {
                let trip_id = id.clone();
                async move { inner.on_dashboards(&trip_id, snapshot).await }
            },
        );
        let id = trip_id.to_string();
        let cards = spawn_listener(
            self,
            cards,
            format!("trips/{}/cards", trip_id),
            move |inner, snapshot| {
                let trip_id = id.clone();
                async move { inner.on_cards(&trip_id, snapshot) }
            },
        );
        let id = trip_id.to_string();
        let expenses = spawn_listener(
            self,
            expenses,
            format!("trips/{}/expenses", trip_id),
            move |inner, snapshot| {
                let trip_id = id.clone();
                async move { inner.on_expenses(&trip_id, snapshot) }
            },
        );
        Ok(vec![dashboards, cards, expenses])
    }

    async fn on_dashboards(self: Arc<Self>, trip_id: &str, snapshot: QuerySnapshot) {
        let (dashboards, stale, fresh) = {
            let Ok(tracking) = lock(&self.tracking, "Subscription tracking") else {
                return;
            };
            if tracking.deleting_trips.contains(trip_id) {
                return;
            }
            let Ok(mut tree) = lock(&self.tree, "Subscription tree") else {
                return;
            };
            if !tree.contains(&[trip_id]) {
                return;
            }
            let dashboards: Vec<Dashboard> = decode_documents::<Dashboard>(&snapshot, &[("tripId", trip_id)])
                .into_iter()
                .map(|(dashboard, _)| dashboard)
                .filter(|d| {
                    !tracking
                        .deleting_dashboards
                        .contains(&(trip_id.to_string(), d.id.clone()))
                })
                .collect();
            let ids: HashSet<String> = dashboards.iter().map(|d| d.id.clone()).collect();
            let stale: Vec<String> = tree
                .child_ids(&[trip_id])
                .into_iter()
                .filter(|id| !ids.contains(id))
                .collect();
            for id in &stale {
                tree.unsubscribe_subtree(&[trip_id, id.as_str()]);
            }
            let fresh: Vec<String> = ids
                .iter()
                .filter(|id| tree.reserve(&[trip_id, id.as_str()]))
                .cloned()
                .collect();
            (dashboards, stale, fresh)
        };

        match write_state(&self.state) {
            Ok(mut state) => {
                state
                    .dashboards
                    .replace_scope(|d| d.trip_id == trip_id, dashboards);
                for dashboard_id in &stale {
                    state.groups.remove_where(|g| &g.dashboard_id == dashboard_id);
                }
            }
            Err(err) => warn!("[Subscriptions] Could not apply dashboards: {}", err),
        }

        for dashboard_id in fresh {
            self.attach_groups(trip_id, &dashboard_id).await;
        }
    }

    async fn attach_groups(self: &Arc<Self>, trip_id: &str, dashboard_id: &str) {
        let scope = CollectionScope::of(EntityKind::Group)
            .in_trip(trip_id)
            .in_dashboard(dashboard_id);
        let result = self.trips.subscribe(&scope, Vec::new()).await;
        let Ok(mut tree) = lock(&self.tree, "Subscription tree") else {
            return;
        };
        match result {
            Ok(listener) => {
                let (trip, dashboard) = (trip_id.to_string(), dashboard_id.to_string());
                let handle = spawn_listener(
                    self,
                    listener,
                    format!("trips/{}/dashboards/{}/groups", trip_id, dashboard_id),
                    move |inner, snapshot| {
                        let (trip_id, dashboard_id) = (trip.clone(), dashboard.clone());
                        async move { inner.on_groups(&trip_id, &dashboard_id, snapshot) }
                    },
                );
                if tree.contains(&[trip_id, dashboard_id]) {
                    tree.attach(&[trip_id, dashboard_id], handle);
                } else {
                    handle.cancel();
                }
            }
            Err(err) => {
                warn!(
                    "[Subscriptions] Could not subscribe to groups of {}: {}",
                    dashboard_id, err
                );
                tree.unsubscribe_subtree(&[trip_id, dashboard_id]);
            }
        }
    }

    fn on_groups(&self, trip_id: &str, dashboard_id: &str, snapshot: QuerySnapshot) {
        let groups: Vec<Group> = decode_documents(
            &snapshot,
            &[("tripId", trip_id), ("dashboardId", dashboard_id)],
        )
        .into_iter()
        .map(|(group, _)| group)
        .collect();
        match write_state(&self.state) {
            Ok(mut state) => state
                .groups
                .replace_scope(|g| g.dashboard_id == dashboard_id, groups),
            Err(err) => warn!("[Subscriptions] Could not apply groups: {}", err),
        }
    }

    fn on_cards(&self, trip_id: &str, snapshot: QuerySnapshot) {
        let cards: Vec<Card> = decode_documents(&snapshot, &[("tripId", trip_id)])
            .into_iter()
            .map(|(card, _)| card)
            .collect();
        match write_state(&self.state) {
            Ok(mut state) => state
                .cards
                .replace_scope(|c| c.trip_id.as_deref() == Some(trip_id), cards),
            Err(err) => warn!("[Subscriptions] Could not apply cards: {}", err),
        }
    }

    fn on_expenses(&self, trip_id: &str, snapshot: QuerySnapshot) {
        let expenses: Vec<Expense> = decode_documents(&snapshot, &[("tripId", trip_id)])
            .into_iter()
            .map(|(expense, _)| expense)
            .collect();
        match write_state(&self.state) {
            Ok(mut state) => state
                .expenses
                .replace_scope(|e| e.trip_id == trip_id, expenses),
            Err(err) => warn!("[Subscriptions] Could not apply expenses: {}", err),
        }
    }

    fn on_settings(&self, snapshot: QuerySnapshot) {
        let pending_local = self
            .queue
            .as_ref()
            .is_some_and(|q| q.contains(ACCOUNT_SETTINGS_ID, EntityKind::Settings));
        if pending_local {
            debug!("[Subscriptions] Local settings change pending, inbound settings ignored");
            return;
        }
        let account = QuerySnapshot {
            documents: snapshot
                .documents
                .into_iter()
                .filter(|doc| doc.id() == ACCOUNT_SETTINGS_ID)
                .collect(),
        };
        let settings = decode_documents::<AccountSettings>(&account, &[])
            .into_iter()
            .next()
            .map(|(settings, _)| settings);
        let Some(settings) = settings else {
            return;
        };
        match write_state(&self.state) {
            Ok(mut state) => state.settings = Some(settings),
            Err(err) => warn!("[Subscriptions] Could not apply settings: {}", err),
        }
    }

    /// Commits deletes stage by stage, each split into batches of at most
    /// the write limit. Earlier stages hold descendants of later ones.
    async fn commit_deletes(&self, stages: Vec<Vec<DocumentPath>>) -> Result<usize> {
        let limit = self.batch_write_limit.max(1);
        let mut deleted = 0;
        for stage in stages {
            for chunk in stage.chunks(limit) {
                let mut batch = WriteBatch::default();
                for path in chunk {
                    batch.delete(path.clone());
                }
                self.trips.store().commit(batch).await?;
                deleted += chunk.len();
            }
        }
        Ok(deleted)
    }

    async fn query_paths(&self, query: Query) -> Result<Vec<DocumentPath>> {
        Ok(self
            .trips
            .store()
            .query(&query)
            .await?
            .into_iter()
            .map(|doc| doc.path)
            .collect())
    }
}

/// Follows the trips visible to one user (owned or shared with their
/// email) and every collection nested under them.
pub struct TripSubscriptionManager {
    inner: Arc<Inner>,
}

impl TripSubscriptionManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        state: SharedState,
        user_id: impl Into<String>,
        email: impl Into<String>,
        batch_write_limit: usize,
        queue: Option<Arc<DirtyQueue>>,
    ) -> Self {
        let user_id: String = user_id.into();
        let email: String = email.into();
        Self {
            inner: Arc::new(Inner {
                email: email.trim().to_lowercase(),
                trips: TripTreeRepository::new(Arc::clone(&store)),
                account: UserScopedRepository::new(store, user_id.clone()),
                user_id,
                state,
                queue,
                batch_write_limit,
                tracking: Mutex::new(Tracking::default()),
                tree: Mutex::new(SubscriptionTree::new()),
                roots: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Opens the owned-trips, shared-trips and settings listeners. Calling
    /// it again while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if !lock(&inner.roots, "Subscription roots")?.is_empty() {
            return Ok(());
        }
        let trips_scope = CollectionScope::of(EntityKind::Trip);
        let settings_scope = CollectionScope::of(EntityKind::Settings);
        let (owned, shared, settings) = futures::try_join!(
            inner.trips.subscribe(
                &trips_scope,
                vec![Filter::equals("ownerId", inner.user_id.as_str())]
            ),
            inner.trips.subscribe(
                &trips_scope,
                vec![Filter::array_contains("collaborators", inner.email.as_str())]
            ),
            inner.account.subscribe(&settings_scope, Vec::new()),
        )?;

        let handles = vec![
            spawn_listener(inner, owned, "owned trips".to_string(), |inner, snapshot| {
                inner.on_trips(TripSource::Owned, snapshot)
            }),
            spawn_listener(inner, shared, "shared trips".to_string(), |inner, snapshot| {
                inner.on_trips(TripSource::Shared, snapshot)
            }),
            spawn_listener(inner, settings, "settings".to_string(), |inner, snapshot| {
                async move { inner.on_settings(snapshot) }
            }),
        ];
        lock(&inner.roots, "Subscription roots")?.extend(handles);
        info!(
            "[Subscriptions] Following trips for user {}",
            inner.user_id
        );
        Ok(())
    }

    /// Cancels every listener. Returns how many were cancelled.
    pub fn stop(&self) -> Result<usize> {
        let roots = std::mem::take(&mut *lock(&self.inner.roots, "Subscription roots")?);
        let mut cancelled = roots.len();
        for handle in roots {
            handle.cancel();
        }
        let mut tracking = lock(&self.inner.tracking, "Subscription tracking")?;
        cancelled += lock(&self.inner.tree, "Subscription tree")?.unsubscribe_all();
        *tracking = Tracking::default();
        debug!("[Subscriptions] Stopped {} listener(s)", cancelled);
        Ok(cancelled)
    }

    pub fn trip_phase(&self, trip_id: &str) -> TripPhase {
        lock(&self.inner.tracking, "Subscription tracking")
            .ok()
            .and_then(|tracking| tracking.phases.get(trip_id).copied())
            .unwrap_or(TripPhase::Unsubscribed)
    }

    /// Live listeners, optionally only those under one trip.
    pub fn listener_count(&self, trip_id: Option<&str>) -> usize {
        let tree = match lock(&self.inner.tree, "Subscription tree") {
            Ok(tree) => tree,
            Err(_) => return 0,
        };
        match trip_id {
            Some(trip_id) => tree.listener_count(&[trip_id]),
            None => {
                tree.listener_count(&[])
                    + lock(&self.inner.roots, "Subscription roots")
                        .map(|roots| roots.len())
                        .unwrap_or_default()
            }
        }
    }

    async fn save_entity<T: Entity>(&self, entity: &T) -> Result<()> {
        let patch = DocumentPatch::from_entity(entity)?;
        self.inner.trips.save(&entity.record_key(), patch).await
    }

    /// New trips must be owned by the user; existing ones need edit access.
    pub async fn save_trip(&self, trip: &Trip) -> Result<()> {
        let known = read_state(&self.inner.state)?.trips.contains(&trip.id);
        if known {
            self.inner.editable_trip(&trip.id)?;
        } else if !trip.is_owned_by(&self.inner.user_id) {
            return Err(Error::PermissionDenied(format!(
                "trip {} belongs to another user",
                trip.id
            )));
        }
        self.save_entity(trip).await
    }

    pub async fn save_dashboard(&self, dashboard: &Dashboard) -> Result<()> {
        self.inner.editable_trip(&dashboard.trip_id)?;
        self.save_entity(dashboard).await
    }

    pub async fn save_group(&self, group: &Group) -> Result<()> {
        self.inner.editable_trip(&group.trip_id)?;
        self.save_entity(group).await
    }

    /// Cards must carry a trip id to be placed in the trip tree.
    pub async fn save_card(&self, card: &Card) -> Result<()> {
        let Some(trip_id) = card.trip_id.as_deref() else {
            return Err(Error::invalid_input(format!(
                "card {} has no trip id",
                card.id
            )));
        };
        self.inner.editable_trip(trip_id)?;
        self.save_entity(card).await
    }

    pub async fn save_expense(&self, expense: &Expense) -> Result<()> {
        self.inner.editable_trip(&expense.trip_id)?;
        self.save_entity(expense).await
    }

    pub async fn delete_group(
        &self,
        trip_id: &str,
        dashboard_id: &str,
        group_id: &str,
    ) -> Result<()> {
        self.inner.editable_trip(trip_id)?;
        let key = RecordKey::new(EntityKind::Group, group_id)
            .in_trip(trip_id)
            .in_dashboard(dashboard_id);
        self.inner.trips.delete(&key).await
    }

    pub async fn delete_card(&self, trip_id: &str, card_id: &str) -> Result<()> {
        self.inner.editable_trip(trip_id)?;
        let key = RecordKey::new(EntityKind::Card, card_id).in_trip(trip_id);
        self.inner.trips.delete(&key).await
    }

    pub async fn delete_expense(&self, trip_id: &str, expense_id: &str) -> Result<()> {
        self.inner.editable_trip(trip_id)?;
        let key = RecordKey::new(EntityKind::Expense, expense_id).in_trip(trip_id);
        self.inner.trips.delete(&key).await
    }

    /// Deletes a trip and everything under it. Owner only; the check runs
    /// before any remote call. Listeners for the trip are cancelled first,
    /// then descendants are deleted before the trip document.
    pub async fn delete_trip(&self, trip_id: &str) -> Result<usize> {
        let inner = &self.inner;
        inner.owned_trip(trip_id)?;

        inner.begin_trip_delete(trip_id)?;
        let result = self.delete_trip_documents(trip_id).await;
        inner.end_trip_delete(trip_id, result.is_ok()).await;
        let deleted = result?;

        write_state(&inner.state)?.remove_trip_tree(trip_id);
        info!(
            "[Subscriptions] Deleted trip {} ({} document(s))",
            trip_id, deleted
        );
        Ok(deleted)
    }

    async fn delete_trip_documents(&self, trip_id: &str) -> Result<usize> {
        let inner = &self.inner;
        let trip_path = inner.trips.trip_path(trip_id)?;
        let dashboards = inner
            .query_paths(Query::all(
                trip_path.collection(EntityKind::Dashboard.collection_name())?,
            ))
            .await?;
        let mut groups = Vec::new();
        for dashboard in &dashboards {
            groups.extend(
                inner
                    .query_paths(Query::all(
                        dashboard.collection(EntityKind::Group.collection_name())?,
                    ))
                    .await?,
            );
        }
        let mut children = dashboards;
        for kind in [EntityKind::Card, EntityKind::Expense] {
            children.extend(
                inner
                    .query_paths(Query::all(trip_path.collection(kind.collection_name())?))
                    .await?,
            );
        }

        inner
            .commit_deletes(vec![groups, children, vec![trip_path]])
            .await
    }

    /// Deletes a dashboard with its groups and cards. Only the trip owner
    /// may do this.
    pub async fn delete_dashboard(&self, trip_id: &str, dashboard_id: &str) -> Result<usize> {
        let inner = &self.inner;
        inner.owned_trip(trip_id)?;

        inner.begin_dashboard_delete(trip_id, dashboard_id)?;
        let result = self.delete_dashboard_documents(trip_id, dashboard_id).await;
        inner
            .end_dashboard_delete(trip_id, dashboard_id, result.is_ok())
            .await;
        let deleted = result?;

        {
            let mut state = write_state(&inner.state)?;
            state.dashboards.remove(dashboard_id);
            state.groups.remove_where(|g| g.dashboard_id == dashboard_id);
            state.cards.remove_where(|c| c.dashboard_id == dashboard_id);
        }
        info!(
            "[Subscriptions] Deleted dashboard {} of trip {} ({} document(s))",
            dashboard_id, trip_id, deleted
        );
        Ok(deleted)
    }

    async fn delete_dashboard_documents(
        &self,
        trip_id: &str,
        dashboard_id: &str,
    ) -> Result<usize> {
        let inner = &self.inner;
        let trip_path = inner.trips.trip_path(trip_id)?;
        let dashboard_path = trip_path
            .collection(EntityKind::Dashboard.collection_name())?
            .doc(dashboard_id)?;
        let mut children = inner
            .query_paths(Query::all(
                dashboard_path.collection(EntityKind::Group.collection_name())?,
            ))
            .await?;
        children.extend(
            inner
                .query_paths(
                    Query::all(trip_path.collection(EntityKind::Card.collection_name())?)
                        .filter(Filter::equals("dashboardId", dashboard_id)),
                )
                .await?,
        );

        inner
            .commit_deletes(vec![children, vec![dashboard_path]])
            .await
    }

    /// Grants `email` access to an owned trip.
    pub async fn share_trip(&self, trip_id: &str, email: &str, can_edit: bool) -> Result<Trip> {
        if email.trim().is_empty() {
            return Err(Error::invalid_input("collaborator email is empty"));
        }
        let mut trip = self.inner.owned_trip(trip_id)?;
        if trip.share_with(email, can_edit) {
            trip.updated_at = Some(Utc::now());
            self.save_trip(&trip).await?;
            write_state(&self.inner.state)?.trips.insert(trip.clone());
        }
        Ok(trip)
    }

    pub async fn unshare_trip(&self, trip_id: &str, email: &str) -> Result<Trip> {
        let mut trip = self.inner.owned_trip(trip_id)?;
        if trip.unshare_with(email) {
            trip.updated_at = Some(Utc::now());
            self.save_trip(&trip).await?;
            write_state(&self.inner.state)?.trips.insert(trip.clone());
        }
        Ok(trip)
    }
}

impl Drop for TripSubscriptionManager {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
