//! REST client for a hosted document database.
//!
//! Documents are addressed under
//! `{base}/v1/projects/{project}/databases/(default)/documents/{path}`.
//! Live listeners are emulated by polling the query and emitting a snapshot
//! only when the result set changed.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use tripsync_core::config::SyncConfig;
use tripsync_core::remote::{
    DocumentPatch, DocumentPath, DocumentSnapshot, DocumentStore, Filter, ListenEvent, Listener,
    ListenerRegistration, Query, QuerySnapshot, WriteBatch, WriteOp,
};

use crate::error::{DocumentClientError, Result};
use crate::types::*;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;
const DATABASE_ID: &str = "(default)";

fn encode_filters(filters: &[Filter]) -> Option<QueryFilter> {
    let mut encoded: Vec<QueryFilter> = filters
        .iter()
        .map(|filter| {
            let (field, op, value) = match filter {
                Filter::Equals { field, value } => (field, "EQUAL", value),
                Filter::ArrayContains { field, value } => (field, "ARRAY_CONTAINS", value),
            };
            QueryFilter::FieldFilter(FieldFilter {
                field: FieldReference {
                    field_path: quote_field_path(field),
                },
                op,
                value: encode_value(value),
            })
        })
        .collect();
    match encoded.len() {
        0 => None,
        1 => encoded.pop(),
        _ => Some(QueryFilter::CompositeFilter(CompositeFilter {
            op: "AND",
            filters: encoded,
        })),
    }
}

/// Client for the document database REST API.
#[derive(Debug, Clone)]
pub struct DocumentClient {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    token: Arc<RwLock<Option<String>>>,
    poll_interval: Duration,
}

impl DocumentClient {
    fn log_response(status: StatusCode, body: &str) {
        if status.is_success() {
            debug!("[DocumentClient] Response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[DocumentClient] Response error ({}): {}", status, preview);
    }

    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - API root, e.g. "https://firestore.googleapis.com"
    /// * `project_id` - project owning the database
    pub fn new(base_url: &str, project_id: &str) -> Result<Self> {
        if project_id.trim().is_empty() {
            return Err(DocumentClientError::invalid_request("Missing project id"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.trim().to_string(),
            token: Arc::new(RwLock::new(None)),
            poll_interval: Duration::from_secs(
                tripsync_core::config::DEFAULT_LISTEN_POLL_INTERVAL_SECS,
            ),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let base_url = config
            .document_api_url
            .as_deref()
            .ok_or_else(|| DocumentClientError::invalid_request("Missing document API URL"))?;
        let project_id = config
            .project_id
            .as_deref()
            .ok_or_else(|| DocumentClientError::invalid_request("Missing project id"))?;
        Ok(Self::new(base_url, project_id)?
            .with_poll_interval(Duration::from_secs(config.listen_poll_interval_secs.max(1))))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Replaces the bearer token sent with every request. Clones share it.
    pub fn set_token(&self, token: Option<String>) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = token;
    }

    fn database_root(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.project_id, DATABASE_ID
        )
    }

    fn documents_url(&self) -> String {
        format!("{}/v1/{}", self.base_url, self.database_root())
    }

    fn document_url(&self, path: &DocumentPath) -> String {
        let encoded: Vec<String> = path
            .segments()
            .iter()
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        format!("{}/{}", self.documents_url(), encoded.join("/"))
    }

    fn document_name(&self, path: &DocumentPath) -> String {
        format!("{}/{}", self.database_root(), path)
    }

    fn path_from_name(&self, name: &str) -> Result<DocumentPath> {
        let prefix = format!("{}/", self.database_root());
        let relative = name.strip_prefix(&prefix).ok_or_else(|| {
            DocumentClientError::invalid_response(format!("Foreign document name {}", name))
        })?;
        DocumentPath::parse(relative)
            .map_err(|e| DocumentClientError::invalid_response(e.to_string()))
    }

    fn snapshot(&self, document: WireDocument) -> Result<DocumentSnapshot> {
        let name = document
            .name
            .as_deref()
            .ok_or_else(|| DocumentClientError::invalid_response("Document without a name"))?;
        Ok(DocumentSnapshot {
            path: self.path_from_name(name)?,
            fields: decode_fields(&document.fields)?,
            has_pending_writes: false,
        })
    }

    /// Create headers for an API request.
    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let token = self.token.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(token) = token {
            let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| DocumentClientError::auth("Invalid access token format"))?;
            headers.insert(AUTHORIZATION, auth_value);
        }

        Ok(headers)
    }

    fn api_error(status: StatusCode, body: &str) -> DocumentClientError {
        if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(body) {
            let label = error.error.status.unwrap_or_default();
            return DocumentClientError::api(
                status.as_u16(),
                format!("{}: {}", label, error.error.message),
            );
        }
        DocumentClientError::api(status.as_u16(), format!("Request failed: {}", body))
    }

    /// Parse a JSON response body.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            return Err(Self::api_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            log::error!(
                "[DocumentClient] Failed to deserialize response. Body: {}, Error: {}",
                body,
                e
            );
            DocumentClientError::api(status.as_u16(), format!("Failed to parse response: {}", e))
        })
    }

    /// Checks the status of a response whose body is not needed.
    async fn ensure_success(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);
        if status.is_success() {
            return Ok(());
        }
        Err(Self::api_error(status, &body))
    }

    /// Fetch one document; `None` when it does not exist.
    ///
    /// GET /v1/projects/{project}/databases/(default)/documents/{path}
    pub async fn get_document(&self, path: &DocumentPath) -> Result<Option<DocumentSnapshot>> {
        let response = self
            .client
            .get(self.document_url(path))
            .headers(self.headers()?)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let document: WireDocument = Self::parse_response(response).await?;
        Ok(Some(self.snapshot(document)?))
    }

    /// Merge write. Every patched field is named in the update mask, so a
    /// field in the mask but absent from the body is deleted remotely.
    ///
    /// PATCH /v1/.../documents/{path}?updateMask.fieldPaths=...
    pub async fn patch_document(&self, path: &DocumentPath, patch: &DocumentPatch) -> Result<()> {
        if patch.is_empty() {
            // An empty mask would overwrite the whole document.
            debug!("[DocumentClient] Skipping empty patch of {}", path);
            return Ok(());
        }
        let mask: Vec<String> = patch
            .field_paths()
            .into_iter()
            .map(|field| {
                format!(
                    "updateMask.fieldPaths={}",
                    urlencoding::encode(&quote_field_path(field))
                )
            })
            .collect();
        let url = format!("{}?{}", self.document_url(path), mask.join("&"));
        let body = WireDocument {
            fields: encode_fields(&patch.set_fields()),
            ..WireDocument::default()
        };
        debug!("[DocumentClient] Patching {} ({} field(s))", path, mask.len());

        let response = self
            .client
            .patch(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        Self::ensure_success(response).await
    }

    /// Deleting a missing document succeeds.
    ///
    /// DELETE /v1/.../documents/{path}
    pub async fn delete_document(&self, path: &DocumentPath) -> Result<()> {
        let response = self
            .client
            .delete(self.document_url(path))
            .headers(self.headers()?)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::ensure_success(response).await
    }

    /// Apply every write atomically.
    ///
    /// POST /v1/.../documents:commit
    pub async fn commit_writes(&self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let writes = batch
            .ops
            .iter()
            .map(|op| match op {
                WriteOp::Merge { path, patch } => Write {
                    update: Some(WireDocument {
                        name: Some(self.document_name(path)),
                        fields: encode_fields(&patch.set_fields()),
                        ..WireDocument::default()
                    }),
                    update_mask: Some(DocumentMask {
                        field_paths: patch
                            .field_paths()
                            .into_iter()
                            .map(quote_field_path)
                            .collect(),
                    }),
                    delete: None,
                },
                WriteOp::Delete { path } => Write {
                    update: None,
                    update_mask: None,
                    delete: Some(self.document_name(path)),
                },
            })
            .collect();
        let url = format!("{}:commit", self.documents_url());
        debug!("[DocumentClient] Committing {} write(s)", batch.len());

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&CommitRequest { writes })
            .send()
            .await?;

        Self::ensure_success(response).await
    }

    /// Documents of the query's collection matching every filter.
    ///
    /// POST /v1/.../documents[/{parent}]:runQuery
    pub async fn run_query(&self, query: &Query) -> Result<Vec<DocumentSnapshot>> {
        let url = match query.collection.parent_document() {
            Some(parent) => format!("{}:runQuery", self.document_url(&parent)),
            None => format!("{}:runQuery", self.documents_url()),
        };
        let request = RunQueryRequest {
            structured_query: StructuredQuery {
                from: vec![CollectionSelector {
                    collection_id: query.collection.collection_id().to_string(),
                }],
                filter: encode_filters(&query.filters),
            },
        };

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;

        let items: Vec<RunQueryResponseItem> = Self::parse_response(response).await?;
        items
            .into_iter()
            .filter_map(|item| item.document)
            .map(|document| self.snapshot(document))
            .collect()
    }

    /// Runs the query once, then keeps polling it. The first event is the
    /// current result; later events are sent only when the result changed.
    pub async fn poll_query(&self, query: Query) -> Result<Listener> {
        let initial = self.run_query(&query).await?;
        let (tx, rx) = mpsc::unbounded_channel::<ListenEvent>();
        let _ = tx.send(Ok(QuerySnapshot {
            documents: initial.clone(),
        }));

        let client = self.clone();
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut last = initial;
            let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                match client.run_query(&query).await {
                    Ok(documents) => {
                        if documents == last {
                            continue;
                        }
                        last = documents.clone();
                        if tx.send(Ok(QuerySnapshot { documents })).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("[DocumentClient] Polling {} failed: {}", query, err);
                        if tx.send(Err(err.into())).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("[DocumentClient] Stopped polling {}", query);
        });

        Ok(Listener {
            events: rx,
            registration: ListenerRegistration::new(move || handle.abort()),
        })
    }
}

#[async_trait]
impl DocumentStore for DocumentClient {
    async fn get(&self, path: &DocumentPath) -> tripsync_core::Result<Option<DocumentSnapshot>> {
        Ok(self.get_document(path).await?)
    }

    async fn set_merge(&self, path: &DocumentPath, patch: DocumentPatch) -> tripsync_core::Result<()> {
        Ok(self.patch_document(path, &patch).await?)
    }

    async fn delete(&self, path: &DocumentPath) -> tripsync_core::Result<()> {
        Ok(self.delete_document(path).await?)
    }

    async fn query(&self, query: &Query) -> tripsync_core::Result<Vec<DocumentSnapshot>> {
        Ok(self.run_query(query).await?)
    }

    async fn commit(&self, batch: WriteBatch) -> tripsync_core::Result<()> {
        Ok(self.commit_writes(&batch).await?)
    }

    async fn listen(&self, query: Query) -> tripsync_core::Result<Listener> {
        Ok(self.poll_query(query).await?)
    }
}
