//! Remote document database abstraction.
//!
//! The remote side is a hierarchical document store: documents live at
//! `collection/id[/collection/id...]` paths, support merge writes with
//! explicit field deletion, equality and array-contains queries, batched
//! commits and live query listeners.

mod memory;
mod patch;
mod repository;

pub use memory::MemoryDocumentStore;
pub use patch::{DocumentPatch, FieldPatch};
pub use repository::{
    repository_for, CollectionScope, RemoteMode, RemoteRepository, TripTreeRepository,
    UserScopedRepository,
};

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{Error, RemoteError, Result};

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() || segment.contains('/') {
        return Err(Error::invalid_input(format!(
            "Invalid document path segment '{}'",
            segment
        )));
    }
    Ok(())
}

/// Path of a collection: an odd number of segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath {
    segments: Vec<String>,
}

impl CollectionPath {
    pub fn root(collection: &str) -> Result<Self> {
        validate_segment(collection)?;
        Ok(Self {
            segments: vec![collection.to_string()],
        })
    }

    pub fn doc(&self, id: &str) -> Result<DocumentPath> {
        validate_segment(id)?;
        let mut segments = self.segments.clone();
        segments.push(id.to_string());
        Ok(DocumentPath { segments })
    }

    /// Last segment, the collection id.
    pub fn collection_id(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn parent_document(&self) -> Option<DocumentPath> {
        if self.segments.len() < 3 {
            return None;
        }
        Some(DocumentPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

/// Path of a document: an even, non-zero number of segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentPath {
    segments: Vec<String>,
}

impl DocumentPath {
    pub fn parse(path: &str) -> Result<Self> {
        let segments: Vec<String> = path.trim_matches('/').split('/').map(String::from).collect();
        if segments.len() % 2 != 0 {
            return Err(Error::invalid_input(format!(
                "'{}' is not a document path",
                path
            )));
        }
        for segment in &segments {
            validate_segment(segment)?;
        }
        Ok(Self { segments })
    }

    pub fn collection(&self, collection: &str) -> Result<CollectionPath> {
        validate_segment(collection)?;
        let mut segments = self.segments.clone();
        segments.push(collection.to_string());
        Ok(CollectionPath { segments })
    }

    pub fn id(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn parent(&self) -> CollectionPath {
        CollectionPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True when `self` is `other` or lives underneath it.
    pub fn is_within(&self, other: &DocumentPath) -> bool {
        self.segments.starts_with(&other.segments)
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Equals {
        field: String,
        value: serde_json::Value,
    },
    ArrayContains {
        field: String,
        value: serde_json::Value,
    },
}

impl Filter {
    pub fn equals(field: &str, value: impl Into<serde_json::Value>) -> Self {
        Self::Equals {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn array_contains(field: &str, value: impl Into<serde_json::Value>) -> Self {
        Self::ArrayContains {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn matches(&self, fields: &serde_json::Map<String, serde_json::Value>) -> bool {
        match self {
            Filter::Equals { field, value } => fields.get(field) == Some(value),
            Filter::ArrayContains { field, value } => fields
                .get(field)
                .and_then(|v| v.as_array())
                .is_some_and(|items| items.contains(value)),
        }
    }
}

/// Documents of one collection matching every filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: CollectionPath,
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn all(collection: CollectionPath) -> Self {
        Self {
            collection,
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn matches(&self, snapshot: &DocumentSnapshot) -> bool {
        snapshot.path.parent() == self.collection
            && self.filters.iter().all(|f| f.matches(&snapshot.fields))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.collection)?;
        for filter in &self.filters {
            match filter {
                Filter::Equals { field, value } => write!(f, " [{} == {}]", field, value)?,
                Filter::ArrayContains { field, value } => {
                    write!(f, " [{} contains {}]", field, value)?
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub path: DocumentPath,
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// Set while the write that produced this state has not been
    /// acknowledged by the server.
    pub has_pending_writes: bool,
}

impl DocumentSnapshot {
    pub fn id(&self) -> &str {
        self.path.id()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuerySnapshot {
    pub documents: Vec<DocumentSnapshot>,
}

impl QuerySnapshot {
    pub fn has_pending_writes(&self) -> bool {
        self.documents.iter().any(|d| d.has_pending_writes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Merge {
        path: DocumentPath,
        patch: DocumentPatch,
    },
    Delete {
        path: DocumentPath,
    },
}

/// Writes committed atomically.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn merge(&mut self, path: DocumentPath, patch: DocumentPatch) -> &mut Self {
        self.ops.push(WriteOp::Merge { path, patch });
        self
    }

    pub fn delete(&mut self, path: DocumentPath) -> &mut Self {
        self.ops.push(WriteOp::Delete { path });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Event delivered to a live listener.
pub type ListenEvent = std::result::Result<QuerySnapshot, RemoteError>;

/// Cancels a listener when removed or dropped.
pub struct ListenerRegistration {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerRegistration {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn remove(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// A live query: the first event is the current result set, later events
/// follow every change.
#[derive(Debug)]
pub struct Listener {
    pub events: mpsc::UnboundedReceiver<ListenEvent>,
    pub registration: ListenerRegistration,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocumentPath) -> Result<Option<DocumentSnapshot>>;

    /// Merges `patch` into the document, creating it when missing. Fields
    /// marked [`FieldPatch::Delete`] are removed.
    async fn set_merge(&self, path: &DocumentPath, patch: DocumentPatch) -> Result<()>;

    async fn delete(&self, path: &DocumentPath) -> Result<()>;

    async fn query(&self, query: &Query) -> Result<Vec<DocumentSnapshot>>;

    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    async fn listen(&self, query: Query) -> Result<Listener>;
}
