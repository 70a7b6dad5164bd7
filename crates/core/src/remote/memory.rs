//! In-process document store with live listeners.
//!
//! Serves as the remote backend for tests and offline development. Besides
//! the [`DocumentStore`] contract it can inject write failures, hold
//! acknowledgements to simulate pending writes, and count mutations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    DocumentPatch, DocumentPath, DocumentSnapshot, DocumentStore, ListenEvent, Listener,
    ListenerRegistration, Query, QuerySnapshot, WriteBatch, WriteOp,
};
use crate::errors::{Error, RemoteError, Result};

#[derive(Debug, Clone)]
struct StoredDocument {
    fields: serde_json::Map<String, serde_json::Value>,
    pending: bool,
}

struct ListenerEntry {
    query: Query,
    tx: mpsc::UnboundedSender<ListenEvent>,
    last_sent: Option<QuerySnapshot>,
}

#[derive(Default)]
struct Inner {
    documents: BTreeMap<DocumentPath, StoredDocument>,
    listeners: HashMap<u64, ListenerEntry>,
    next_listener_id: u64,
    failing_prefixes: Vec<DocumentPath>,
    unavailable: bool,
    hold_acknowledgements: bool,
    merge_count: usize,
    delete_count: usize,
    commit_count: usize,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(RemoteError::unavailable("document store unreachable").into());
        }
        Ok(())
    }

    fn check_writable(&self, path: &DocumentPath) -> Result<()> {
        self.check_available()?;
        if self.failing_prefixes.iter().any(|p| path.is_within(p)) {
            return Err(RemoteError::unavailable(format!("write to {} failed", path)).into());
        }
        Ok(())
    }

    fn apply_merge(&mut self, path: &DocumentPath, patch: &DocumentPatch) {
        let pending = self.hold_acknowledgements;
        let doc = self
            .documents
            .entry(path.clone())
            .or_insert_with(|| StoredDocument {
                fields: serde_json::Map::new(),
                pending,
            });
        patch.apply_to(&mut doc.fields);
        doc.pending = pending;
        self.merge_count += 1;
    }

    fn apply_delete(&mut self, path: &DocumentPath) {
        self.documents.remove(path);
        self.delete_count += 1;
    }

    fn run_query(&self, query: &Query) -> QuerySnapshot {
        let documents = self
            .documents
            .iter()
            .map(|(path, doc)| DocumentSnapshot {
                path: path.clone(),
                fields: doc.fields.clone(),
                has_pending_writes: doc.pending,
            })
            .filter(|snapshot| query.matches(snapshot))
            .collect();
        QuerySnapshot { documents }
    }

    /// Pushes a fresh snapshot to every listener whose result changed and
    /// drops listeners whose receiver is gone.
    fn notify(&mut self) {
        let mut closed = Vec::new();
        let ids: Vec<u64> = self.listeners.keys().copied().collect();
        for id in ids {
            let Some(query) = self.listeners.get(&id).map(|e| e.query.clone()) else {
                continue;
            };
            let snapshot = self.run_query(&query);
            if let Some(entry) = self.listeners.get_mut(&id) {
                if entry.last_sent.as_ref() == Some(&snapshot) {
                    continue;
                }
                if entry.tx.send(Ok(snapshot.clone())).is_err() {
                    closed.push(id);
                } else {
                    entry.last_sent = Some(snapshot);
                }
            }
        }
        for id in closed {
            self.listeners.remove(&id);
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Unexpected("Document store lock is poisoned".to_string()))
    }

    /// Makes writes at or below `prefix` fail with an unavailable error.
    pub fn fail_writes_under(&self, prefix: DocumentPath) -> Result<()> {
        self.lock()?.failing_prefixes.push(prefix);
        Ok(())
    }

    pub fn clear_write_failures(&self) -> Result<()> {
        self.lock()?.failing_prefixes.clear();
        Ok(())
    }

    /// Simulates the store being unreachable for every operation.
    pub fn set_unavailable(&self, unavailable: bool) -> Result<()> {
        self.lock()?.unavailable = unavailable;
        Ok(())
    }

    /// While held, written documents report pending writes until
    /// [`acknowledge_all`](Self::acknowledge_all).
    pub fn hold_acknowledgements(&self, hold: bool) -> Result<()> {
        self.lock()?.hold_acknowledgements = hold;
        Ok(())
    }

    pub fn acknowledge_all(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.hold_acknowledgements = false;
        for doc in inner.documents.values_mut() {
            doc.pending = false;
        }
        inner.notify();
        Ok(())
    }

    pub fn document_fields(
        &self,
        path: &DocumentPath,
    ) -> Result<Option<serde_json::Map<String, serde_json::Value>>> {
        Ok(self.lock()?.documents.get(path).map(|d| d.fields.clone()))
    }

    pub fn document_count(&self) -> Result<usize> {
        Ok(self.lock()?.documents.len())
    }

    pub fn merge_count(&self) -> Result<usize> {
        Ok(self.lock()?.merge_count)
    }

    /// Deletions, single and batched.
    pub fn delete_count(&self) -> Result<usize> {
        Ok(self.lock()?.delete_count)
    }

    pub fn commit_count(&self) -> Result<usize> {
        Ok(self.lock()?.commit_count)
    }

    pub fn active_listener_count(&self) -> Result<usize> {
        Ok(self.lock()?.listeners.len())
    }
}

fn remove_listener(inner: &Weak<Mutex<Inner>>, id: u64) {
    if let Some(inner) = inner.upgrade() {
        if let Ok(mut guard) = inner.lock() {
            guard.listeners.remove(&id);
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, path: &DocumentPath) -> Result<Option<DocumentSnapshot>> {
        let inner = self.lock()?;
        inner.check_available()?;
        Ok(inner.documents.get(path).map(|doc| DocumentSnapshot {
            path: path.clone(),
            fields: doc.fields.clone(),
            has_pending_writes: doc.pending,
        }))
    }

    async fn set_merge(&self, path: &DocumentPath, patch: DocumentPatch) -> Result<()> {
        let mut inner = self.lock()?;
        inner.check_writable(path)?;
        inner.apply_merge(path, &patch);
        inner.notify();
        Ok(())
    }

    async fn delete(&self, path: &DocumentPath) -> Result<()> {
        let mut inner = self.lock()?;
        inner.check_writable(path)?;
        inner.apply_delete(path);
        inner.notify();
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<DocumentSnapshot>> {
        let inner = self.lock()?;
        inner.check_available()?;
        Ok(inner.run_query(query).documents)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut inner = self.lock()?;
        for op in &batch.ops {
            match op {
                WriteOp::Merge { path, .. } | WriteOp::Delete { path } => {
                    inner.check_writable(path)?
                }
            }
        }
        for op in &batch.ops {
            match op {
                WriteOp::Merge { path, patch } => inner.apply_merge(path, patch),
                WriteOp::Delete { path } => inner.apply_delete(path),
            }
        }
        inner.commit_count += 1;
        inner.notify();
        Ok(())
    }

    async fn listen(&self, query: Query) -> Result<Listener> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock()?;
        inner.check_available()?;
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;

        let initial = inner.run_query(&query);
        // Receiver is alive here, so the first send cannot fail.
        let _ = tx.send(Ok(initial.clone()));
        inner.listeners.insert(
            id,
            ListenerEntry {
                query,
                tx,
                last_sent: Some(initial),
            },
        );

        let weak = Arc::downgrade(&self.inner);
        Ok(Listener {
            events: rx,
            registration: ListenerRegistration::new(move || remove_listener(&weak, id)),
        })
    }
}
