//! Vector search over per-document chunk embeddings.
//!
//! Documents are stored one per search-engine record, with their chunks
//! nested under `docChunks`. A query is always scoped to a single document:
//! the backend matches the document by ID and ranks that document's chunk
//! vectors against the query vector, returning chunk text in relevance
//! order joined by blank lines.
//!
//! # Backends
//!
//! - [`ElasticsearchClient`] speaks the Elasticsearch REST API over reqwest.
//! - [`memory::MemorySearch`] keeps documents in process and ranks chunks
//!   with [`crate::embedding::cosine_similarity`].
//!
//! Both implement [`VectorSearch`] for the query pipeline,
//! [`DocumentIndexer`] for ingestion, and [`DocumentCatalog`] for finding
//! documents by their title and metadata.

pub mod memory;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::SearchConfig;
use crate::error::Cancelled;

/// Nested field holding a document's chunks.
pub const CHUNKS_FIELD: &str = "docChunks";
/// Vector field inside each chunk.
pub const VECTOR_FIELD: &str = "docChunks.vector";
/// Text field inside each chunk.
pub const TEXT_FIELD: &str = "docChunks.textChunk";

/// Separator between matching chunk texts.
pub const CHUNK_SEPARATOR: &str = "\n\n";

/// The target document matched nothing in the index.
#[derive(Debug, thiserror::Error)]
#[error("document with ID {document_id} not found")]
pub struct DocumentNotFound {
    pub index_id: String,
    pub document_id: String,
}

/// Ranked chunk text for one document.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Returns the chunk texts of `document_id` closest to `vector`, at most
    /// `max_results` of them, joined by [`CHUNK_SEPARATOR`].
    ///
    /// Fails with [`DocumentNotFound`] when the document does not exist and
    /// with [`Cancelled`] when `cancel` fires first.
    async fn search_document_chunks(
        &self,
        cancel: &CancellationToken,
        index_id: &str,
        document_id: &str,
        vector: &[f32],
        max_results: usize,
    ) -> Result<String>;
}

/// Index provisioning and document writes used by ingestion.
#[async_trait]
pub trait DocumentIndexer: Send + Sync {
    /// Creates `index` with the chunk mapping if missing. Returns `true`
    /// when the index was created by this call.
    async fn ensure_index(&self, index: &str, dims: usize) -> Result<bool>;

    /// Stores `document` and returns its generated ID.
    async fn index_document(
        &self,
        cancel: &CancellationToken,
        index: &str,
        document: &IndexedDocument,
    ) -> Result<String>;
}

/// Document lookup by metadata, used to find the ID to query.
#[async_trait]
pub trait DocumentCatalog: Send + Sync {
    /// Documents in `index` matching every non-empty field of `filter`,
    /// best match first.
    async fn find_documents(
        &self,
        cancel: &CancellationToken,
        index: &str,
        filter: &DocumentFilter,
    ) -> Result<Vec<DocumentSummary>>;
}

/// Default number of documents returned by [`DocumentCatalog::find_documents`].
pub const DEFAULT_FIND_SIZE: usize = 20;

/// Field criteria for a document lookup. Text fields use full-text `match`
/// semantics; the dates bound the ingestion timestamp (RFC 3339 or
/// `YYYY-MM-DD`, inclusive). An empty filter matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentFilter {
    pub title: String,
    pub meta_text_desc: String,
    pub meta_key_words: String,
    pub date_from: String,
    pub date_to: String,
    pub size: Option<usize>,
}

impl DocumentFilter {
    pub fn size(&self) -> usize {
        self.size.filter(|&n| n > 0).unwrap_or(DEFAULT_FIND_SIZE)
    }
}

/// Document metadata without its chunks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
    pub meta_text_desc: String,
    pub meta_key_words: String,
    pub source_location: String,
    pub timestamp: String,
}

/// Fields returned by a document lookup.
const SUMMARY_FIELDS: [&str; 5] = [
    "title",
    "metaTextDesc",
    "metaKeyWords",
    "sourceLocation",
    "timestamp",
];

/// One searchable document with its embedded chunks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexedDocument {
    pub title: String,
    pub meta_text_desc: String,
    pub meta_key_words: String,
    pub source_location: String,
    /// RFC 3339.
    pub timestamp: String,
    pub doc_chunks: Vec<DocumentChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunk {
    pub text_chunk: String,
    pub vector: Vec<f32>,
}

/// Index mapping for documents with `dims`-dimensional chunk vectors.
pub fn index_mapping(dims: usize) -> Value {
    json!({
        "properties": {
            "metaKeyWords": { "type": "text" },
            "metaTextDesc": { "type": "text" },
            "docChunks": {
                "type": "nested",
                "properties": {
                    "textChunk": { "type": "text" },
                    "vector": {
                        "type": "dense_vector",
                        "dims": dims,
                        "index": true,
                        "similarity": "cosine",
                        "index_options": {
                            "type": "int8_hnsw",
                            "m": 24,
                            "ef_construction": 200
                        }
                    }
                }
            },
            "sourceLocation": { "type": "text" },
            "timestamp": { "type": "date" },
            "title": { "type": "text" }
        }
    })
}

/// Query body for a kNN search restricted to one document's chunks.
pub fn document_chunks_query(
    document_id: &str,
    vector: &[f32],
    k: usize,
    num_candidates: usize,
    max_results: usize,
) -> Value {
    let id_filter = json!({ "ids": { "values": [document_id] } });
    json!({
        "query": {
            "bool": { "filter": [id_filter.clone()] }
        },
        "knn": {
            "field": VECTOR_FIELD,
            "query_vector": vector,
            "k": k,
            "num_candidates": num_candidates,
            "filter": id_filter,
            "inner_hits": {
                "size": max_results,
                "_source": false,
                "fields": [TEXT_FIELD]
            }
        },
        "size": 1,
        "_source": false
    })
}

/// Query body for a metadata lookup.
pub fn document_fields_query(filter: &DocumentFilter) -> Value {
    let mut must: Vec<Value> = [
        ("title", &filter.title),
        ("metaTextDesc", &filter.meta_text_desc),
        ("metaKeyWords", &filter.meta_key_words),
    ]
    .into_iter()
    .filter(|(_, value)| !value.trim().is_empty())
    .map(|(field, value)| json!({ "match": { field: value.trim() } }))
    .collect();

    let mut range = serde_json::Map::new();
    if !filter.date_from.trim().is_empty() {
        range.insert("gte".into(), json!(filter.date_from.trim()));
    }
    if !filter.date_to.trim().is_empty() {
        range.insert("lte".into(), json!(filter.date_to.trim()));
    }
    if !range.is_empty() {
        must.push(json!({ "range": { "timestamp": range } }));
    }

    let query = if must.is_empty() {
        json!({ "match_all": {} })
    } else {
        json!({ "bool": { "must": must } })
    };
    json!({
        "query": query,
        "size": filter.size(),
        "_source": SUMMARY_FIELDS,
    })
}

// ============ Response Parsing ============

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: HitList<DocumentHit>,
}

#[derive(Debug, Deserialize)]
struct HitList<T> {
    #[serde(default = "Vec::new")]
    hits: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct DocumentHit {
    #[serde(default)]
    inner_hits: HashMap<String, InnerHitGroup>,
}

#[derive(Debug, Deserialize)]
struct InnerHitGroup {
    hits: HitList<ChunkHit>,
}

#[derive(Debug, Deserialize)]
struct ChunkHit {
    #[serde(default)]
    fields: HashMap<String, Vec<ChunkFields>>,
}

#[derive(Debug, Deserialize)]
struct ChunkFields {
    #[serde(rename = "textChunk", default)]
    text_chunk: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SummaryHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: DocumentSummary,
}

/// Extracts document summaries from a metadata lookup response.
pub fn collect_summaries(body: &Value) -> Result<Vec<DocumentSummary>> {
    let response = HitList::<SummaryHit>::deserialize(
        body.get("hits").unwrap_or(&Value::Null),
    )
    .context("unexpected search response format")?;
    Ok(response
        .hits
        .into_iter()
        .map(|hit| DocumentSummary {
            id: hit.id,
            ..hit.source
        })
        .collect())
}

/// Extracts the ranked chunk texts from a search response body.
pub fn collect_chunk_text(body: &Value, index_id: &str, document_id: &str) -> Result<String> {
    let response = SearchResponse::deserialize(body)
        .context("unexpected search response format")?;

    let Some(hit) = response.hits.hits.into_iter().next() else {
        return Err(DocumentNotFound {
            index_id: index_id.to_string(),
            document_id: document_id.to_string(),
        }
        .into());
    };

    let Some(group) = hit.inner_hits.get(CHUNKS_FIELD) else {
        bail!("no {} inner hits in document {}", CHUNKS_FIELD, document_id);
    };

    let texts: Vec<&str> = group
        .hits
        .hits
        .iter()
        .filter_map(|chunk| chunk.fields.get(CHUNKS_FIELD))
        .filter_map(|fields| fields.first())
        .filter_map(|fields| fields.text_chunk.first())
        .map(String::as_str)
        .collect();

    Ok(texts.join(CHUNK_SEPARATOR))
}

// ============ Elasticsearch ============

pub struct ElasticsearchClient {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    knn_k: usize,
    num_candidates: usize,
}

#[derive(Deserialize)]
struct CatIndex {
    index: String,
}

#[derive(Deserialize)]
struct IndexResult {
    #[serde(rename = "_id")]
    id: String,
}

impl ElasticsearchClient {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build search HTTP client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.resolved_password(),
            knn_k: config.knn_k,
            num_candidates: config.num_candidates,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let builder = self.client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        builder: RequestBuilder,
    ) -> Result<reqwest::Response> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled.into()),
            response = builder.send() => response.context("search backend request failed"),
        }
    }

    /// Index names matching `pattern` (e.g. `document-*`).
    pub async fn list_indices(&self, pattern: &str) -> Result<Vec<String>> {
        let response = self
            .send(
                &CancellationToken::new(),
                self.request(Method::GET, &format!("_cat/indices/{}", pattern))
                    .query(&[("format", "json")]),
            )
            .await?;
        let response = error_for_status(response).await?;
        let indices: Vec<CatIndex> = response
            .json()
            .await
            .context("error decoding indices response")?;
        let mut names: Vec<String> = indices.into_iter().map(|i| i.index).collect();
        names.sort();
        Ok(names)
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!(
        "search backend returned {}: {}",
        status,
        truncate(&body, 512)
    );
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[async_trait]
impl VectorSearch for ElasticsearchClient {
    async fn search_document_chunks(
        &self,
        cancel: &CancellationToken,
        index_id: &str,
        document_id: &str,
        vector: &[f32],
        max_results: usize,
    ) -> Result<String> {
        let body = document_chunks_query(
            document_id,
            vector,
            self.knn_k,
            self.num_candidates,
            max_results,
        );
        let response = self
            .send(
                cancel,
                self.request(Method::POST, &format!("{}/_search", index_id))
                    .json(&body),
            )
            .await?;
        let response = error_for_status(response).await?;
        let body: Value = response
            .json()
            .await
            .context("error parsing search response")?;

        let text = collect_chunk_text(&body, index_id, document_id)?;
        tracing::debug!(
            index = index_id,
            document = document_id,
            bytes = text.len(),
            "document chunk search complete"
        );
        Ok(text)
    }
}

#[async_trait]
impl DocumentIndexer for ElasticsearchClient {
    async fn ensure_index(&self, index: &str, dims: usize) -> Result<bool> {
        let token = CancellationToken::new();
        let exists = self.send(&token, self.request(Method::HEAD, index)).await?;
        match exists.status() {
            StatusCode::OK => return Ok(false),
            StatusCode::NOT_FOUND => {}
            other => bail!("unexpected response when checking index '{}': {}", index, other),
        }

        let response = self
            .send(
                &token,
                self.request(Method::PUT, index)
                    .json(&json!({ "mappings": index_mapping(dims) })),
            )
            .await?;
        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            if body.contains("resource_already_exists_exception") {
                return Ok(false);
            }
            bail!("error creating index '{}': {}", index, truncate(&body, 512));
        }
        error_for_status(response).await?;
        tracing::info!(index, dims, "created search index");
        Ok(true)
    }

    async fn index_document(
        &self,
        cancel: &CancellationToken,
        index: &str,
        document: &IndexedDocument,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let response = self
            .send(
                cancel,
                self.request(Method::PUT, &format!("{}/_doc/{}", index, id))
                    .query(&[("refresh", "wait_for")])
                    .json(document),
            )
            .await?;
        let response = error_for_status(response).await?;
        let result: IndexResult = response
            .json()
            .await
            .context("error decoding index response")?;
        Ok(result.id)
    }
}

#[async_trait]
impl DocumentCatalog for ElasticsearchClient {
    async fn find_documents(
        &self,
        cancel: &CancellationToken,
        index: &str,
        filter: &DocumentFilter,
    ) -> Result<Vec<DocumentSummary>> {
        let response = self
            .send(
                cancel,
                self.request(Method::POST, &format!("{}/_search", index))
                    .json(&document_fields_query(filter)),
            )
            .await?;
        let response = error_for_status(response).await?;
        let body: Value = response
            .json()
            .await
            .context("error parsing search response")?;
        let documents = collect_summaries(&body)?;
        tracing::debug!(index, found = documents.len(), "document lookup complete");
        Ok(documents)
    }
}
