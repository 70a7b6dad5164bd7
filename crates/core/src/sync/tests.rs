use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use super::*;
use crate::config::SyncConfig;
use crate::errors::{Error, Result};
use crate::models::{Card, Dashboard, Entity, EntityKind, Expense, Group, RecordKey, Trip};
use crate::operations::EntityOperations;
use crate::remote::{
    CollectionPath, CollectionScope, DocumentPatch, DocumentPath, DocumentSnapshot, DocumentStore,
    Filter, Listener, MemoryDocumentStore, Query, RemoteMode, RemoteRepository,
    TripTreeRepository, UserScopedRepository, WriteBatch,
};
use crate::session::{SessionBackends, SessionIdentity, SyncSession};
use crate::state::{new_shared_state, read_state, SharedState};
use crate::store::{put_entity, DirtyItemStore, LocalStore, MemoryLocalStore};
use crate::subscription::{TripPhase, TripSubscriptionManager};
use rust_decimal_macros::dec;

const USER: &str = "u1";
const EMAIL: &str = "me@example.com";

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn user_doc(collection: &str, id: &str) -> DocumentPath {
    DocumentPath::parse(&format!("users/{}/{}/{}", USER, collection, id)).expect("path")
}

struct Harness {
    store: Arc<MemoryDocumentStore>,
    local: Arc<MemoryLocalStore>,
    state: SharedState,
    engine: Arc<ReconciliationEngine>,
    ops: EntityOperations,
}

fn harness_with(
    online: bool,
    remote: Arc<dyn RemoteRepository>,
    store: Arc<MemoryDocumentStore>,
) -> Harness {
    let local = Arc::new(MemoryLocalStore::new());
    let state = new_shared_state();
    let queue = Arc::new(DirtyQueue::new(local.clone(), USER));
    let engine = Arc::new(
        ReconciliationEngine::new(
            state.clone(),
            queue,
            Arc::new(ConnectivityMonitor::new(online)),
            remote,
            DIRTY_THRESHOLD,
        )
        .with_trip_tree(Arc::new(TripTreeRepository::new(store.clone()))),
    );
    let ops = EntityOperations::new(state.clone(), local.clone(), engine.clone());
    Harness {
        store,
        local,
        state,
        engine,
        ops,
    }
}

fn harness(online: bool) -> Harness {
    let store = Arc::new(MemoryDocumentStore::new());
    let remote = Arc::new(UserScopedRepository::new(store.clone(), USER));
    harness_with(online, remote, store)
}

fn manager(
    store: &Arc<MemoryDocumentStore>,
    state: &SharedState,
    queue: Option<Arc<DirtyQueue>>,
    batch_write_limit: usize,
) -> TripSubscriptionManager {
    TripSubscriptionManager::new(
        store.clone(),
        state.clone(),
        USER,
        EMAIL,
        batch_write_limit,
        queue,
    )
}

async fn seed<T: Entity>(store: &Arc<MemoryDocumentStore>, entity: &T) {
    TripTreeRepository::new(store.clone())
        .save(
            &entity.record_key(),
            DocumentPatch::from_entity(entity).expect("patch"),
        )
        .await
        .expect("seed");
}

fn trip(id: &str, owner: &str) -> Trip {
    let mut trip = Trip::new(id, owner);
    trip.id = id.to_string();
    trip
}

fn dashboard(id: &str, trip_id: &str) -> Dashboard {
    let mut dashboard = Dashboard::new(trip_id, id);
    dashboard.id = id.to_string();
    dashboard
}

fn trip_card(id: &str, trip_id: &str, dashboard_id: &str) -> Card {
    let mut card = Card::new(dashboard_id, id);
    card.id = id.to_string();
    card.trip_id = Some(trip_id.to_string());
    card
}

/// Holds every remote write until permits are added to the gate.
struct GatedRepository {
    inner: UserScopedRepository,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl RemoteRepository for GatedRepository {
    fn mode(&self) -> RemoteMode {
        self.inner.mode()
    }

    fn document_path(&self, key: &RecordKey) -> Result<DocumentPath> {
        self.inner.document_path(key)
    }

    fn collection_path(&self, scope: &CollectionScope) -> Result<CollectionPath> {
        self.inner.collection_path(scope)
    }

    async fn save(&self, key: &RecordKey, patch: DocumentPatch) -> Result<()> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| Error::Unexpected("gate closed".to_string()))?;
        self.inner.save(key, patch).await
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| Error::Unexpected("gate closed".to_string()))?;
        self.inner.delete(key).await
    }

    async fn subscribe(&self, scope: &CollectionScope, filters: Vec<Filter>) -> Result<Listener> {
        self.inner.subscribe(scope, filters).await
    }
}

/// Forwards to the in-memory store, parking one-shot queries while `hold`
/// is set until permits are added to the gate.
struct HeldQueryStore {
    inner: Arc<MemoryDocumentStore>,
    hold: AtomicBool,
    parked: AtomicUsize,
    gate: Semaphore,
}

impl HeldQueryStore {
    fn new(inner: Arc<MemoryDocumentStore>) -> Self {
        Self {
            inner,
            hold: AtomicBool::new(false),
            parked: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl DocumentStore for HeldQueryStore {
    async fn get(&self, path: &DocumentPath) -> Result<Option<DocumentSnapshot>> {
        self.inner.get(path).await
    }

    async fn set_merge(&self, path: &DocumentPath, patch: DocumentPatch) -> Result<()> {
        self.inner.set_merge(path, patch).await
    }

    async fn delete(&self, path: &DocumentPath) -> Result<()> {
        self.inner.delete(path).await
    }

    async fn query(&self, query: &Query) -> Result<Vec<DocumentSnapshot>> {
        if self.hold.load(Ordering::SeqCst) {
            self.parked.fetch_add(1, Ordering::SeqCst);
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| Error::Unexpected("gate closed".to_string()))?;
        }
        self.inner.query(query).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.inner.commit(batch).await
    }

    async fn listen(&self, query: Query) -> Result<Listener> {
        self.inner.listen(query).await
    }
}

#[tokio::test]
async fn marking_the_same_item_repeatedly_counts_once() {
    let h = harness(true);
    for _ in 0..5 {
        h.engine
            .mark_dirty("c1", EntityKind::Card)
            .await
            .expect("mark");
    }
    assert_eq!(h.engine.pending_changes(), 1);
    assert_eq!(
        h.local.load_dirty_items(USER).await.expect("load"),
        vec![DirtyItem::new("c1", EntityKind::Card)]
    );
}

#[tokio::test]
async fn forced_pass_converges_remote_to_live_state() {
    let h = harness(true);
    let mut notices = h.engine.subscribe_notices();

    let mut kept = Card::new("d1", "Alfama walk");
    kept.notes = Some("bring water".to_string());
    let kept = h.ops.add_card(kept).await.expect("add");
    let dropped = h.ops.add_card(Card::new("d1", "Cancelled")).await.expect("add");

    let report = h.engine.force_sync().await.expect("sync");
    assert_eq!(report.status, ReconcileStatus::Completed);
    assert_eq!(report.upserted, 2);
    assert_eq!(h.engine.pending_changes(), 0);
    assert!(h.engine.last_synced_at().is_some());
    assert_eq!(
        notices.recv().await.expect("notice"),
        SyncNotice::SyncCompleted {
            upserted: 2,
            deleted: 0
        }
    );

    // Clearing a field must delete it remotely, not leave the old value.
    let mut edited = kept.clone();
    edited.notes = None;
    edited.cost = Some(dec!(12.50));
    h.ops.update_card(edited).await.expect("update");
    h.ops.delete_card(&dropped.id).await.expect("delete");

    let report = h.engine.force_sync().await.expect("sync");
    assert_eq!((report.upserted, report.deleted), (1, 1));
    assert_eq!(h.engine.pending_changes(), 0);

    let remote = h
        .store
        .document_fields(&user_doc("cards", &kept.id))
        .expect("read")
        .expect("kept card");
    assert_eq!(remote.get("title"), Some(&json!("Alfama walk")));
    assert!(!remote.contains_key("notes"));
    assert_eq!(remote.get("cost"), Some(&json!(12.5)));
    assert!(h
        .store
        .document_fields(&user_doc("cards", &dropped.id))
        .expect("read")
        .is_none());
}

#[tokio::test]
async fn failed_writes_stay_dirty_while_others_clear() {
    let h = harness(true);
    let mut notices = h.engine.subscribe_notices();
    let mut ids = Vec::new();
    for title in ["Tower", "Bridge", "Market"] {
        ids.push(h.ops.add_card(Card::new("d1", title)).await.expect("add").id);
    }
    h.store
        .fail_writes_under(user_doc("cards", &ids[1]))
        .expect("inject");

    let report = h.engine.force_sync().await.expect("sync");
    assert_eq!(report.status, ReconcileStatus::PartiallyFailed);
    assert_eq!(report.upserted, 2);
    assert_eq!(report.failed, vec![DirtyItem::new(&ids[1], EntityKind::Card)]);
    assert_eq!(h.engine.pending_changes(), 1);
    assert!(h.engine.queue().contains(&ids[1], EntityKind::Card));
    assert!(h.engine.last_synced_at().is_none());
    assert!(matches!(
        notices.recv().await.expect("notice"),
        SyncNotice::SyncFailed { failed: 1, .. }
    ));

    // The next pass retries the failed item only.
    h.store.clear_write_failures().expect("clear");
    let report = h.engine.force_sync().await.expect("sync");
    assert_eq!(report.upserted, 1);
    assert_eq!(h.engine.pending_changes(), 0);
}

#[tokio::test]
async fn offline_mutations_queue_until_connectivity_returns() {
    let h = harness(false);
    let card = h.ops.add_card(Card::new("d1", "Ferry")).await.expect("add");
    let mut moved = card.clone();
    moved.position = 3;
    h.ops.update_card(moved).await.expect("update");
    h.ops.add_card(Card::new("d1", "Lunch")).await.expect("add");
    h.ops.add_card(Card::new("d1", "Museum")).await.expect("add");

    assert_eq!(h.engine.pending_changes(), 3);
    let report = h.engine.force_sync().await.expect("sync");
    assert_eq!(report.status, ReconcileStatus::Skipped(SkipReason::Offline));
    assert_eq!(h.store.merge_count().expect("count"), 0);
    assert_eq!(h.store.delete_count().expect("count"), 0);
    assert!(!h.engine.status().is_online);

    let scheduler = SyncScheduler::new(
        h.engine.clone(),
        Duration::from_secs(RECONCILE_INTERVAL_SECS),
    );
    scheduler.ensure_started().await;
    h.engine.set_online(true);
    eventually(|| h.engine.pending_changes() == 0).await;
    assert_eq!(h.store.merge_count().expect("count"), 3);
    scheduler.ensure_stopped().await;
}

#[tokio::test]
async fn concurrent_request_is_dropped_and_mid_flight_marks_survive() {
    let store = Arc::new(MemoryDocumentStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let remote = Arc::new(GatedRepository {
        inner: UserScopedRepository::new(store.clone(), USER),
        gate: gate.clone(),
    });
    let h = harness_with(true, remote, store);
    let first = h.ops.add_card(Card::new("d1", "Early")).await.expect("add");

    let runner = tokio::spawn({
        let engine = h.engine.clone();
        async move { engine.force_sync().await }
    });
    eventually(|| h.engine.is_syncing()).await;

    let dropped = h.engine.force_sync().await.expect("sync");
    assert_eq!(
        dropped.status,
        ReconcileStatus::Skipped(SkipReason::AlreadySyncing)
    );
    let late = h.ops.add_card(Card::new("d1", "Late")).await.expect("add");

    gate.add_permits(10);
    let report = runner.await.expect("join").expect("sync");
    assert_eq!(report.upserted, 1);
    assert!(!h.engine.queue().contains(&first.id, EntityKind::Card));
    assert!(h.engine.queue().contains(&late.id, EntityKind::Card));
    assert!(!h.engine.is_syncing());
}

#[tokio::test]
async fn edit_made_during_a_push_is_sent_on_the_next_pass() {
    let store = Arc::new(MemoryDocumentStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let remote = Arc::new(GatedRepository {
        inner: UserScopedRepository::new(store.clone(), USER),
        gate: gate.clone(),
    });
    let h = harness_with(true, remote, store);
    let card = h.ops.add_card(Card::new("d1", "v1")).await.expect("add");

    let runner = tokio::spawn({
        let engine = h.engine.clone();
        async move { engine.force_sync().await }
    });
    eventually(|| h.engine.is_syncing()).await;

    let mut edited = card.clone();
    edited.title = "v2".to_string();
    h.ops.update_card(edited).await.expect("update");

    gate.add_permits(10);
    let report = runner.await.expect("join").expect("sync");
    assert_eq!(report.upserted, 1);
    let remote = h
        .store
        .document_fields(&user_doc("cards", &card.id))
        .expect("read")
        .expect("card");
    assert_eq!(remote.get("title"), Some(&json!("v1")));
    assert_eq!(h.engine.pending_changes(), 1);
    assert_eq!(h.local.load_dirty_items(USER).await.expect("load").len(), 1);

    let report = h.engine.force_sync().await.expect("sync");
    assert_eq!(report.status, ReconcileStatus::Completed);
    let remote = h
        .store
        .document_fields(&user_doc("cards", &card.id))
        .expect("read")
        .expect("card");
    assert_eq!(remote.get("title"), Some(&json!("v2")));
    assert_eq!(h.engine.pending_changes(), 0);
}

#[tokio::test]
async fn shared_entities_reconcile_into_the_trip_tree() {
    let h = harness(true);
    let mut shared = Trip::new("Kyoto", USER);
    shared.share_with("friend@example.com", false);
    let shared = h.ops.add_trip(shared).await.expect("trip");
    let private = h.ops.add_trip(Trip::new("Solo", USER)).await.expect("trip");
    let day = h
        .ops
        .add_dashboard(Dashboard::new(&shared.id, "Day 1"))
        .await
        .expect("dashboard");
    let mut placed = Card::new(&day.id, "Temple");
    placed.trip_id = Some(shared.id.clone());
    let placed = h.ops.add_card(placed).await.expect("card");
    let loose = h.ops.add_card(Card::new("d9", "Notes")).await.expect("card");

    let report = h.engine.force_sync().await.expect("sync");
    assert_eq!(report.status, ReconcileStatus::Completed);
    assert_eq!(report.upserted, 5);

    let tree_doc = |path: String| {
        h.store
            .document_fields(&DocumentPath::parse(&path).expect("path"))
            .expect("read")
    };
    assert!(tree_doc(format!("trips/{}", shared.id)).is_some());
    assert!(tree_doc(format!("trips/{}/dashboards/{}", shared.id, day.id)).is_some());
    assert!(tree_doc(format!("trips/{}/cards/{}", shared.id, placed.id)).is_some());
    assert!(tree_doc(format!("users/{}/trips/{}", USER, private.id)).is_some());
    assert!(tree_doc(format!("users/{}/cards/{}", USER, loose.id)).is_some());
    assert!(tree_doc(format!("users/{}/trips/{}", USER, shared.id)).is_none());
}

#[tokio::test(start_paused = true)]
async fn threshold_triggers_a_pass_before_the_timer() {
    let h = harness(true);
    let interval = Duration::from_secs(RECONCILE_INTERVAL_SECS);
    let scheduler = SyncScheduler::new(h.engine.clone(), interval);
    scheduler.ensure_started().await;
    let started = tokio::time::Instant::now();

    for i in 0..=DIRTY_THRESHOLD {
        h.ops
            .add_card(Card::new("d1", format!("Stop {}", i)))
            .await
            .expect("add");
    }
    eventually(|| h.engine.pending_changes() == 0).await;
    assert!(started.elapsed() < interval);
    scheduler.ensure_stopped().await;
    assert!(!scheduler.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn timer_drains_items_below_the_threshold() {
    let h = harness(true);
    let scheduler = SyncScheduler::new(
        h.engine.clone(),
        Duration::from_secs(RECONCILE_INTERVAL_SECS),
    );
    scheduler.ensure_started().await;
    h.ops.add_card(Card::new("d1", "Sunset")).await.expect("add");

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.engine.pending_changes(), 1);

    tokio::time::sleep(Duration::from_secs(RECONCILE_INTERVAL_SECS)).await;
    eventually(|| h.engine.pending_changes() == 0).await;
    scheduler.ensure_stopped().await;
}

#[tokio::test]
async fn status_watch_follows_pending_changes() {
    let h = harness(true);
    let mut status = h.engine.subscribe_status();
    h.ops.add_card(Card::new("d1", "Cafe")).await.expect("add");
    status.changed().await.expect("changed");
    assert_eq!(status.borrow_and_update().pending_changes, 1);

    h.engine.force_sync().await.expect("sync");
    let current = h.engine.status();
    assert_eq!(current.pending_changes, 0);
    assert!(!current.is_syncing);
    assert!(current.last_synced_at.is_some());
}

#[tokio::test]
async fn inbound_updates_never_mark_dirty() {
    let h = harness(true);
    let subs = manager(&h.store, &h.state, Some(h.engine.queue().clone()), 500);
    let mut shared = trip("shared", "u2");
    shared.share_with(EMAIL, false);
    seed(&h.store, &shared).await;
    seed(&h.store, &dashboard("d1", "shared")).await;
    seed(&h.store, &trip_card("c1", "shared", "d1")).await;

    subs.start().await.expect("start");
    eventually(|| {
        read_state(&h.state)
            .map(|s| s.cards.contains("c1") && s.dashboards.contains("d1"))
            .unwrap_or(false)
    })
    .await;

    seed(&h.store, &trip_card("c2", "shared", "d1")).await;
    eventually(|| {
        read_state(&h.state)
            .map(|s| s.cards.contains("c2"))
            .unwrap_or(false)
    })
    .await;
    assert_eq!(h.engine.pending_changes(), 0);
    assert_eq!(subs.trip_phase("shared"), TripPhase::Live);
}

#[tokio::test]
async fn non_owner_cannot_delete_before_any_remote_write() {
    let h = harness(true);
    let subs = manager(&h.store, &h.state, None, 500);
    let mut shared = trip("t1", "u2");
    shared.share_with(EMAIL, true);
    seed(&h.store, &shared).await;
    seed(&h.store, &dashboard("d1", "t1")).await;

    subs.start().await.expect("start");
    eventually(|| {
        read_state(&h.state)
            .map(|s| s.dashboards.contains("d1"))
            .unwrap_or(false)
    })
    .await;

    let err = subs.delete_trip("t1").await.expect_err("not owner");
    assert!(matches!(err, Error::PermissionDenied(_)));
    let err = subs.delete_dashboard("t1", "d1").await.expect_err("not owner");
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert!(subs.share_trip("t1", "x@example.com", false).await.is_err());

    assert_eq!(h.store.delete_count().expect("count"), 0);
    assert_eq!(h.store.commit_count().expect("count"), 0);
    assert_eq!(subs.trip_phase("t1"), TripPhase::Live);
}

#[tokio::test]
async fn viewers_cannot_write_into_a_shared_trip() {
    let h = harness(true);
    let subs = manager(&h.store, &h.state, None, 500);
    let mut viewing = trip("ro", "u2");
    viewing.share_with(EMAIL, false);
    let mut editing = trip("rw", "u2");
    editing.share_with(EMAIL, true);
    seed(&h.store, &viewing).await;
    seed(&h.store, &editing).await;

    subs.start().await.expect("start");
    eventually(|| {
        subs.trip_phase("ro") == TripPhase::Live && subs.trip_phase("rw") == TripPhase::Live
    })
    .await;
    let baseline = h.store.merge_count().expect("count");

    let denied = [
        subs.save_card(&trip_card("c1", "ro", "d1")).await,
        subs.save_dashboard(&dashboard("d2", "ro")).await,
        subs.save_expense(&Expense::new("ro", "Taxi", dec!(20), "EUR", USER))
            .await,
        subs.delete_card("ro", "c1").await,
        subs.delete_expense("ro", "e1").await,
    ];
    for result in denied {
        assert!(matches!(result, Err(Error::PermissionDenied(_))));
    }
    let mut renamed = viewing.clone();
    renamed.name = "Mine now".to_string();
    assert!(matches!(
        subs.save_trip(&renamed).await,
        Err(Error::PermissionDenied(_))
    ));
    assert!(matches!(
        subs.save_dashboard(&dashboard("d3", "missing")).await,
        Err(Error::NotFound(_))
    ));
    assert_eq!(h.store.merge_count().expect("count"), baseline);
    assert_eq!(h.store.delete_count().expect("count"), 0);

    subs.save_card(&trip_card("c2", "rw", "d1"))
        .await
        .expect("editor write");
    assert_eq!(h.store.merge_count().expect("count"), baseline + 1);
}

#[tokio::test]
async fn revoked_access_drops_the_trip_and_its_listeners() {
    let h = harness(true);
    let subs = manager(&h.store, &h.state, None, 500);
    let mut shared = trip("t1", "u2");
    shared.share_with(EMAIL, false);
    seed(&h.store, &shared).await;
    seed(&h.store, &dashboard("d1", "t1")).await;
    seed(&h.store, &trip_card("c1", "t1", "d1")).await;
    let mut expense = Expense::new("t1", "Hotel", dec!(300), "EUR", "u2");
    expense.id = "e1".to_string();
    seed(&h.store, &expense).await;

    subs.start().await.expect("start");
    eventually(|| subs.listener_count(Some("t1")) == 4).await;
    eventually(|| {
        read_state(&h.state)
            .map(|s| s.cards.contains("c1") && s.expenses.contains("e1"))
            .unwrap_or(false)
    })
    .await;

    shared.unshare_with(EMAIL);
    seed(&h.store, &shared).await;
    eventually(|| subs.trip_phase("t1") == TripPhase::Unsubscribed).await;
    assert_eq!(subs.listener_count(Some("t1")), 0);

    let state = read_state(&h.state).expect("state");
    assert!(!state.trips.contains("t1"));
    assert!(!state.dashboards.contains("d1"));
    assert!(!state.cards.contains("c1"));
    assert!(!state.expenses.contains("e1"));
}

#[tokio::test]
async fn trip_snapshots_during_a_delete_do_not_reattach_listeners() {
    let memory = Arc::new(MemoryDocumentStore::new());
    let held = Arc::new(HeldQueryStore::new(memory.clone()));
    let state = new_shared_state();
    let subs = Arc::new(TripSubscriptionManager::new(
        held.clone(),
        state.clone(),
        USER,
        EMAIL,
        500,
        None,
    ));
    seed(&memory, &trip("t2", USER)).await;
    seed(&memory, &dashboard("d1", "t2")).await;
    subs.start().await.expect("start");
    eventually(|| subs.listener_count(Some("t2")) == 4).await;

    held.hold.store(true, Ordering::SeqCst);
    let deleting = tokio::spawn({
        let subs = subs.clone();
        async move { subs.delete_trip("t2").await }
    });
    eventually(|| held.parked.load(Ordering::SeqCst) > 0).await;
    assert_eq!(subs.trip_phase("t2"), TripPhase::Unsubscribed);
    assert_eq!(subs.listener_count(Some("t2")), 0);

    // A rename while the delete is parked, then a new trip to know the
    // owned-trips snapshot carrying the rename was applied.
    let mut renamed = trip("t2", USER);
    renamed.name = "Renamed".to_string();
    seed(&memory, &renamed).await;
    seed(&memory, &trip("t3", USER)).await;
    eventually(|| subs.trip_phase("t3") == TripPhase::Live).await;
    assert_eq!(subs.trip_phase("t2"), TripPhase::Unsubscribed);
    assert_eq!(subs.listener_count(Some("t2")), 0);

    held.gate.add_permits(16);
    let deleted = deleting.await.expect("join").expect("delete");
    assert_eq!(deleted, 2);
    assert_eq!(subs.listener_count(Some("t2")), 0);
    let state = read_state(&state).expect("state");
    assert!(!state.trips.contains("t2"));
    assert!(state.trips.contains("t3"));
}

#[tokio::test]
async fn dashboard_snapshots_during_a_delete_skip_that_dashboard() {
    let memory = Arc::new(MemoryDocumentStore::new());
    let held = Arc::new(HeldQueryStore::new(memory.clone()));
    let state = new_shared_state();
    let subs = Arc::new(TripSubscriptionManager::new(
        held.clone(),
        state.clone(),
        USER,
        EMAIL,
        500,
        None,
    ));
    seed(&memory, &trip("t1", USER)).await;
    seed(&memory, &dashboard("d1", "t1")).await;
    seed(&memory, &dashboard("d2", "t1")).await;
    subs.start().await.expect("start");
    eventually(|| subs.listener_count(Some("t1")) == 5).await;

    held.hold.store(true, Ordering::SeqCst);
    let deleting = tokio::spawn({
        let subs = subs.clone();
        async move { subs.delete_dashboard("t1", "d1").await }
    });
    eventually(|| held.parked.load(Ordering::SeqCst) > 0).await;
    assert_eq!(subs.listener_count(Some("t1")), 4);

    seed(&memory, &dashboard("d3", "t1")).await;
    eventually(|| {
        subs.listener_count(Some("t1")) == 5
            && read_state(&state)
                .map(|s| s.dashboards.contains("d3"))
                .unwrap_or(false)
    })
    .await;
    assert!(!read_state(&state).expect("state").dashboards.contains("d1"));

    held.gate.add_permits(16);
    assert_eq!(deleting.await.expect("join").expect("delete"), 1);
    assert_eq!(subs.listener_count(Some("t1")), 5);
}

#[tokio::test]
async fn dashboard_snapshots_replace_only_their_own_trip() {
    let h = harness(true);
    let subs = manager(&h.store, &h.state, None, 500);
    for id in ["A", "B"] {
        seed(&h.store, &trip(id, USER)).await;
    }
    seed(&h.store, &dashboard("a1", "A")).await;
    seed(&h.store, &dashboard("b1", "B")).await;

    subs.start().await.expect("start");
    eventually(|| {
        read_state(&h.state)
            .map(|s| s.dashboards.contains("a1") && s.dashboards.contains("b1"))
            .unwrap_or(false)
    })
    .await;

    let mut renamed = dashboard("a1", "A");
    renamed.name = "Arrival".to_string();
    subs.save_dashboard(&renamed).await.expect("save");
    subs.save_dashboard(&dashboard("a2", "A")).await.expect("save");
    eventually(|| {
        read_state(&h.state)
            .map(|s| s.dashboards.contains("a2"))
            .unwrap_or(false)
    })
    .await;

    let state = read_state(&h.state).expect("state");
    assert_eq!(
        state.dashboards.get("a1").map(|d| d.name.as_str()),
        Some("Arrival")
    );
    assert_eq!(state.dashboards.get("b1"), Some(&dashboard("b1", "B")));
    assert_eq!(state.dashboards.len(), 3);
}

#[tokio::test]
async fn unacknowledged_trip_waits_for_children() {
    let h = harness(true);
    let subs = manager(&h.store, &h.state, None, 500);
    subs.start().await.expect("start");

    h.store.hold_acknowledgements(true).expect("hold");
    subs.save_trip(&trip("fresh", USER)).await.expect("save");
    eventually(|| {
        read_state(&h.state)
            .map(|s| s.trips.contains("fresh"))
            .unwrap_or(false)
    })
    .await;
    assert_eq!(subs.trip_phase("fresh"), TripPhase::Subscribing);
    assert_eq!(subs.listener_count(Some("fresh")), 0);

    h.store.acknowledge_all().expect("ack");
    eventually(|| subs.listener_count(Some("fresh")) == 3).await;
    assert_eq!(subs.trip_phase("fresh"), TripPhase::Live);
}

#[tokio::test]
async fn owner_delete_removes_the_tree_children_first_in_chunks() {
    let h = harness(true);
    let subs = manager(&h.store, &h.state, None, 2);
    seed(&h.store, &trip("t1", USER)).await;
    for d in ["d1", "d2"] {
        seed(&h.store, &dashboard(d, "t1")).await;
        let mut group = Group::new("t1", d, "Morning");
        group.id = format!("{}-g", d);
        seed(&h.store, &group).await;
    }
    for c in ["c1", "c2", "c3"] {
        seed(&h.store, &trip_card(c, "t1", "d1")).await;
    }
    let mut expense = Expense::new("t1", "Dinner", dec!(80), "EUR", USER);
    expense.id = "e1".to_string();
    seed(&h.store, &expense).await;
    seed(&h.store, &trip("other", USER)).await;

    subs.start().await.expect("start");
    eventually(|| subs.listener_count(Some("t1")) == 5).await;
    eventually(|| {
        read_state(&h.state)
            .map(|s| s.expenses.contains("e1") && s.groups.len() == 2)
            .unwrap_or(false)
    })
    .await;

    let deleted = subs.delete_trip("t1").await.expect("delete");
    assert_eq!(deleted, 9);
    // Groups: 1 batch, dashboards/cards/expenses: 3 batches, trip: 1 batch.
    assert_eq!(h.store.commit_count().expect("count"), 5);
    assert_eq!(h.store.document_count().expect("count"), 1);
    assert_eq!(subs.listener_count(Some("t1")), 0);

    let state = read_state(&h.state).expect("state");
    assert!(!state.trips.contains("t1"));
    assert!(state.trips.contains("other"));
    assert!(state.cards.is_empty() && state.groups.is_empty() && state.expenses.is_empty());
}

#[tokio::test]
async fn owner_shares_and_unshares_a_trip() {
    let h = harness(true);
    let subs = manager(&h.store, &h.state, None, 500);
    seed(&h.store, &trip("t1", USER)).await;
    subs.start().await.expect("start");
    eventually(|| subs.trip_phase("t1") == TripPhase::Live).await;

    let shared = subs
        .share_trip("t1", " Friend@Example.com ", true)
        .await
        .expect("share");
    assert_eq!(shared.collaborators, vec!["friend@example.com"]);
    assert_eq!(shared.editors, vec!["friend@example.com"]);

    let path = TripTreeRepository::new(h.store.clone())
        .trip_path("t1")
        .expect("path");
    let fields = h.store.document_fields(&path).expect("read").expect("trip");
    assert_eq!(fields.get("collaborators"), Some(&json!(["friend@example.com"])));

    let unshared = subs
        .unshare_trip("t1", "friend@example.com")
        .await
        .expect("unshare");
    assert!(unshared.collaborators.is_empty());
}

#[tokio::test]
async fn session_restores_pending_work_and_logout_wipes_it() {
    let local = Arc::new(MemoryLocalStore::new());
    let store = Arc::new(MemoryDocumentStore::new());
    let saved = Card::new("d1", "Saved offline");
    put_entity(local.as_ref(), &saved).await.expect("put");
    local
        .save_dirty_item(USER, DirtyItem::new(&saved.id, EntityKind::Card))
        .await
        .expect("seed dirty");
    local
        .save_dirty_item("someone-else", DirtyItem::new("x", EntityKind::Card))
        .await
        .expect("seed other");

    let backends = || SessionBackends {
        local: local.clone(),
        dirty_items: local.clone(),
        remote: store.clone(),
        connectivity: Arc::new(ConnectivityMonitor::new(true)),
    };
    let config = SyncConfig::default();

    let session = SyncSession::start(SessionIdentity::new(USER, EMAIL), &config, backends())
        .await
        .expect("start");
    assert_eq!(session.status().pending_changes, 1);
    assert!(read_state(session.state())
        .expect("state")
        .cards
        .contains(&saved.id));

    let report = session.force_sync().await.expect("sync");
    assert_eq!(report.upserted, 1);
    assert!(store
        .document_fields(&user_doc("cards", &saved.id))
        .expect("read")
        .is_some());

    session
        .operations()
        .add_card(Card::new("d1", "Unsynced"))
        .await
        .expect("add");
    session.logout().await.expect("logout");

    assert!(local.get_all(EntityKind::Card).await.expect("cards").is_empty());
    assert!(local.load_dirty_items(USER).await.expect("dirty").is_empty());
    assert_eq!(local.load_dirty_items("someone-else").await.expect("dirty").len(), 1);

    let err = SyncSession::start(SessionIdentity::new(" ", EMAIL), &config, backends())
        .await
        .err()
        .expect("anonymous session");
    assert!(matches!(err, Error::NotAuthenticated));
}
