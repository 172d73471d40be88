//! Boundary to the remote document store of record.
//!
//! The remote store owns the authoritative `version` of every document and
//! bumps it on each accepted write. Two implementations ship with the crate:
//! [`MemoryRemoteStore`] for tests and demos, and [`HttpRemoteStore`] for a
//! JSON REST endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::filter::{self, FilterCondition};
use crate::models::FieldChanges;
use crate::pipeline::{apply_delta, EncodedPayload, WriteBody};
use crate::util::{compact_text, is_http_url, normalize_text_option};

/// Length of ids issued by the remote store on create.
const REMOTE_ID_LEN: usize = 20;

/// A document as held by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub id: String,
    pub fields: Value,
    pub version: u64,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch one document. `None` when it does not exist.
    async fn read(&self, collection: &str, id: &str) -> Result<Option<RemoteDocument>>;

    /// Apply `fields` (dot paths) to a document, creating it if needed.
    /// Returns the new server version.
    async fn write(&self, collection: &str, id: &str, fields: &FieldChanges) -> Result<u64>;

    /// Write an already encoded payload. Transports that can carry the
    /// compressed form override this.
    async fn write_encoded(
        &self,
        collection: &str,
        id: &str,
        payload: &EncodedPayload,
    ) -> Result<u64> {
        self.write(collection, id, &payload.fields).await
    }

    /// Create a document and return it with its permanent id.
    async fn create(&self, collection: &str, fields: &Value) -> Result<RemoteDocument>;

    /// Documents of `collection` matching every condition.
    async fn query(
        &self,
        collection: &str,
        conditions: &[FilterCondition],
    ) -> Result<Vec<RemoteDocument>>;
}

fn generate_remote_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REMOTE_ID_LEN)
        .map(char::from)
        .collect()
}

type Collections = HashMap<String, HashMap<String, RemoteDocument>>;

/// In-process remote store.
///
/// `fail_next_writes` makes the following writes and creates fail with a
/// transient network error, for exercising retry paths.
#[derive(Default)]
pub struct MemoryRemoteStore {
    collections: Mutex<Collections>,
    failures: AtomicU32,
    writes: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Fail the next `count` writes or creates.
    pub fn fail_next_writes(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Seed or overwrite a document directly, bypassing versioning.
    pub fn insert(&self, collection: &str, document: RemoteDocument) {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(document.id.clone(), document);
    }

    /// Number of accepted writes and creates.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .get(collection)
            .map_or(0, HashMap::len)
    }

    fn take_failure(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(Error::Network("injected remote failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn read(&self, collection: &str, id: &str) -> Result<Option<RemoteDocument>> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned())
    }

    async fn write(&self, collection: &str, id: &str, fields: &FieldChanges) -> Result<u64> {
        self.take_failure()?;
        let mut collections = self.collections.lock();
        let document = collections
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_insert_with(|| RemoteDocument {
                id: id.to_string(),
                fields: Value::Object(Map::new()),
                version: 0,
            });

        let mut updated = document.fields.clone();
        apply_delta(&mut updated, fields)?;
        document.fields = updated;
        document.version += 1;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(document.version)
    }

    async fn create(&self, collection: &str, fields: &Value) -> Result<RemoteDocument> {
        self.take_failure()?;
        let document = RemoteDocument {
            id: generate_remote_id(),
            fields: fields.clone(),
            version: 1,
        };
        self.insert(collection, document.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(document)
    }

    async fn query(
        &self,
        collection: &str,
        conditions: &[FilterCondition],
    ) -> Result<Vec<RemoteDocument>> {
        let collections = self.collections.lock();
        let Some(documents) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut matches: Vec<RemoteDocument> = documents
            .values()
            .filter(|document| {
                conditions
                    .iter()
                    .all(|condition| condition.matches(&document.fields))
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }
}

/// JSON REST client for the remote store.
///
/// Routes (relative to the base URL):
/// `GET /v1/{collection}/{id}`, `PATCH /v1/{collection}/{id}`,
/// `POST /v1/{collection}`, `POST /v1/{collection}/query`.
#[derive(Clone)]
pub struct HttpRemoteStore {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteStore")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    version: u64,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    fields: &'a Value,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    conditions: &'a [FilterCondition],
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    documents: Vec<RemoteDocument>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(&base_url.into())?;
        Ok(Self {
            base_url,
            token: None,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    /// Send `token` as a bearer credential on every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, collection: &str, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{}/v1/{collection}/{id}", self.base_url),
            None => format!("{}/v1/{collection}", self.base_url),
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("Accept", "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Remote {
            status: Some(status.as_u16()),
            message: parse_api_error(status, &body),
        })
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn read(&self, collection: &str, id: &str) -> Result<Option<RemoteDocument>> {
        let builder = self.request(reqwest::Method::GET, &self.url(collection, Some(id)));
        match Self::send(builder).await {
            Ok(response) => Ok(Some(response.json::<RemoteDocument>().await?)),
            Err(Error::Remote {
                status: Some(404), ..
            }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn write(&self, collection: &str, id: &str, fields: &FieldChanges) -> Result<u64> {
        let builder = self
            .request(reqwest::Method::PATCH, &self.url(collection, Some(id)))
            .json(&WriteBody { fields });
        let response = Self::send(builder).await?;
        Ok(response.json::<WriteResponse>().await?.version)
    }

    async fn write_encoded(
        &self,
        collection: &str,
        id: &str,
        payload: &EncodedPayload,
    ) -> Result<u64> {
        if !payload.is_compressed() {
            return self.write(collection, id, &payload.fields).await;
        }
        // Same `WriteBody` shape as `write`, deflated.
        let builder = self
            .request(reqwest::Method::PATCH, &self.url(collection, Some(id)))
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "deflate")
            .body(payload.bytes[1..].to_vec());
        let response = Self::send(builder).await?;
        Ok(response.json::<WriteResponse>().await?.version)
    }

    async fn create(&self, collection: &str, fields: &Value) -> Result<RemoteDocument> {
        let builder = self
            .request(reqwest::Method::POST, &self.url(collection, None))
            .json(&CreateRequest { fields });
        let response = Self::send(builder).await?;
        Ok(response.json::<RemoteDocument>().await?)
    }

    async fn query(
        &self,
        collection: &str,
        conditions: &[FilterCondition],
    ) -> Result<Vec<RemoteDocument>> {
        let url = format!("{}/query", self.url(collection, None));
        let builder = self
            .request(reqwest::Method::POST, &url)
            .json(&QueryRequest { conditions });
        let response = Self::send(builder).await?;
        Ok(response.json::<QueryResponse>().await?.documents)
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return message.trim().to_string();
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed
    }
}

fn normalize_base_url(raw: &str) -> Result<String> {
    let url = normalize_text_option(Some(raw.to_string()))
        .ok_or_else(|| Error::InvalidInput("remote URL must not be empty".to_string()))?;
    if is_http_url(&url) {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "remote URL must include http:// or https://".to_string(),
        ))
    }
}

/// Apply client-side ordering and pagination to query results.
pub fn page_documents(
    mut documents: Vec<RemoteDocument>,
    sort_by: Option<&str>,
    order: filter::SortOrder,
    page: usize,
    page_size: usize,
) -> filter::Page<RemoteDocument> {
    if let Some(field) = sort_by {
        documents.sort_by(|a, b| filter::compare_field(&a.fields, &b.fields, field, order));
    }
    filter::paginate(documents, page, page_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterOperator, SortOrder};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn changes(pairs: &[(&str, Value)]) -> FieldChanges {
        pairs
            .iter()
            .map(|(path, value)| ((*path).to_string(), value.clone()))
            .collect()
    }

    #[tokio::test]
    async fn writes_bump_version_and_apply_paths() {
        let store = MemoryRemoteStore::new();
        let first = store
            .write("patient", "p1", &changes(&[("baseline.hba1c", json!(7.2))]))
            .await
            .unwrap();
        let second = store
            .write("patient", "p1", &changes(&[("baseline.weight", json!(80))]))
            .await
            .unwrap();
        assert_eq!((first, second), (1, 2));

        let document = store.read("patient", "p1").await.unwrap().unwrap();
        assert_eq!(document.fields, json!({"baseline": {"hba1c": 7.2, "weight": 80}}));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn create_issues_permanent_id() {
        let store = MemoryRemoteStore::new();
        let document = store
            .create("patient", &json!({"patientInfo": {"initials": "AR"}}))
            .await
            .unwrap();
        assert_eq!(document.id.len(), REMOTE_ID_LEN);
        assert!(!crate::ids::is_temporary(&document.id));
        assert_eq!(document.version, 1);
        assert_eq!(store.len("patient"), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = MemoryRemoteStore::new();
        store.fail_next_writes(1);
        let error = store
            .write("patient", "p1", &changes(&[("status", json!("active"))]))
            .await
            .unwrap_err();
        assert!(error.is_retryable());
        assert!(store
            .write("patient", "p1", &changes(&[("status", json!("active"))]))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn query_filters_documents() {
        let store = MemoryRemoteStore::new();
        for (id, status) in [("a", "active"), ("b", "completed"), ("c", "active")] {
            store.insert(
                "patient",
                RemoteDocument {
                    id: id.to_string(),
                    fields: json!({"status": status}),
                    version: 1,
                },
            );
        }
        let active = store
            .query(
                "patient",
                &[FilterCondition::new("status", FilterOperator::Equals, json!("active"))],
            )
            .await
            .unwrap();
        let ids: Vec<_> = active.iter().map(|document| document.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(store.query("missing", &[]).await.unwrap().is_empty());
    }

    #[test]
    fn page_documents_sorts_before_paging() {
        let documents = vec![
            RemoteDocument { id: "a".to_string(), fields: json!({"age": 40}), version: 1 },
            RemoteDocument { id: "b".to_string(), fields: json!({"age": 60}), version: 1 },
            RemoteDocument { id: "c".to_string(), fields: json!({"age": 50}), version: 1 },
        ];
        let page = page_documents(documents, Some("age"), SortOrder::Desc, 1, 2);
        let ids: Vec<_> = page.items.iter().map(|document| document.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(page.has_more);
    }

    #[test]
    fn base_url_requires_scheme() {
        assert!(normalize_base_url("").is_err());
        assert!(normalize_base_url("api.example.com").is_err());
        assert_eq!(
            normalize_base_url("https://api.example.com/").unwrap(),
            "https://api.example.com"
        );
    }

    #[test]
    fn api_error_prefers_message_field() {
        assert_eq!(
            parse_api_error(StatusCode::CONFLICT, r#"{"message":" version conflict "}"#),
            "version conflict"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, ""), "HTTP 502");
    }

    #[test]
    fn debug_redacts_token() {
        let store = HttpRemoteStore::new("https://api.example.com", Duration::from_secs(5))
            .unwrap()
            .with_token("secret");
        let debug = format!("{store:?}");
        assert!(!debug.contains("secret"));
    }
}
