//! Document ingestion.
//!
//! Load → chunk → embed → index. The source file is read as text, PDF or CSV,
//! split into deduplicated chunks, and each chunk is embedded. A chunk whose
//! embedding fails is skipped; the run fails only when none succeed. The
//! embedded chunks are written as one document and its new ID is the result.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chunk::{chunk_text, dedupe_chunks};
use crate::embedding::Embedder;
use crate::error::PipelineError;
use crate::extract::{load_document, SourceFormat};
use crate::models::DocumentAddRequest;
use crate::pipeline::{checkpoint, classify, enter, finish, Outcome, Stage};
use crate::progress::RequestEvents;
use crate::search::{DocumentChunk, DocumentIndexer, IndexedDocument};

const EMBED_START: u8 = 30;
const EMBED_SPAN: u8 = 55;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Starting,
    Loading,
    Chunking,
    Embedding,
    Indexing,
    Complete,
}

impl Stage for IngestStage {
    fn progress(&self) -> u8 {
        match self {
            IngestStage::Starting => 0,
            IngestStage::Loading => 10,
            IngestStage::Chunking => 20,
            IngestStage::Embedding => EMBED_START,
            IngestStage::Indexing => EMBED_START + EMBED_SPAN,
            IngestStage::Complete => 100,
        }
    }

    fn status(&self) -> &'static str {
        match self {
            IngestStage::Starting => "starting",
            IngestStage::Loading => "loading",
            IngestStage::Chunking => "chunking",
            IngestStage::Embedding => "embedding",
            IngestStage::Indexing => "indexing",
            IngestStage::Complete => "complete",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            IngestStage::Starting => "Initializing document import...",
            IngestStage::Loading => "Loading document...",
            IngestStage::Chunking => "Splitting document into chunks...",
            IngestStage::Embedding => "Embedding chunks...",
            IngestStage::Indexing => "Indexing document...",
            IngestStage::Complete => "Document added successfully",
        }
    }
}

pub struct IngestPipeline {
    embedder: Arc<dyn Embedder>,
    indexer: Arc<dyn DocumentIndexer>,
    default_index: String,
    dims: usize,
    max_tokens: usize,
    overlap_tokens: usize,
}

impl IngestPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        indexer: Arc<dyn DocumentIndexer>,
        default_index: impl Into<String>,
        dims: usize,
        max_tokens: usize,
    ) -> Self {
        Self {
            embedder,
            indexer,
            default_index: default_index.into(),
            dims,
            max_tokens,
            overlap_tokens: 0,
        }
    }

    /// Default chunk overlap for requests that don't set `chunkOverlap`.
    pub fn with_overlap(mut self, overlap_tokens: usize) -> Self {
        self.overlap_tokens = overlap_tokens;
        self
    }

    pub async fn run(
        &self,
        request: &DocumentAddRequest,
        cancel: &CancellationToken,
        events: &RequestEvents,
    ) -> Outcome {
        let started = Instant::now();
        let outcome = Outcome::from_result(self.execute(request, cancel, events).await);
        finish(events, &outcome, started);
        outcome
    }

    async fn execute(
        &self,
        request: &DocumentAddRequest,
        cancel: &CancellationToken,
        events: &RequestEvents,
    ) -> Result<String, PipelineError> {
        let request_id = events.request_id();

        enter(events, IngestStage::Starting);
        request.validate()?;
        let format = SourceFormat::from_embedding_type(&request.embedding_type)
            .map_err(|e| PipelineError::Validation(e.to_string()))?;
        let index = if request.index_name.trim().is_empty() {
            self.default_index.as_str()
        } else {
            request.index_name.trim()
        };

        checkpoint(cancel, events, IngestStage::Loading)?;
        let text = load_document(Path::new(&request.source_location), format)
            .await
            .map_err(|e| PipelineError::Validation(e.to_string()))?;

        checkpoint(cancel, events, IngestStage::Chunking)?;
        let max_tokens = request.chunk_size.unwrap_or(self.max_tokens);
        let overlap = request.chunk_overlap.unwrap_or(self.overlap_tokens);
        let chunks = dedupe_chunks(chunk_text(&text, max_tokens, overlap));
        tracing::info!(
            request_id,
            index,
            max_tokens,
            overlap,
            chunks = chunks.len(),
            "document chunked"
        );

        checkpoint(cancel, events, IngestStage::Embedding)?;
        let total = chunks.len();
        let mut embedded = Vec::with_capacity(total);
        let mut last_error = None;
        for (done, chunk) in chunks.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match self
                .embedder
                .embed(cancel, &request.embedding_args, &chunk.text)
                .await
            {
                Ok(vector) => embedded.push(DocumentChunk {
                    text_chunk: chunk.text,
                    vector,
                }),
                Err(error) if cancel.is_cancelled() || crate::error::is_cancellation(&error) => {
                    return Err(PipelineError::Cancelled);
                }
                Err(error) => {
                    tracing::warn!(
                        request_id,
                        chunk = chunk.index,
                        error = format!("{:#}", error),
                        "skipping chunk that failed to embed"
                    );
                    last_error = Some(error);
                }
            }
            let percent = EMBED_START + (EMBED_SPAN as usize * (done + 1) / total.max(1)) as u8;
            events.progress(
                IngestStage::Embedding.status(),
                &format!("Embedded chunk {} of {}", done + 1, total),
                percent,
            );
        }
        if embedded.is_empty() {
            let error = last_error
                .unwrap_or_else(|| anyhow::anyhow!("document produced no chunks"))
                .context(format!("none of {} chunks could be embedded", total));
            return Err(PipelineError::Embedding {
                step: "chunk embedding",
                error,
            });
        }
        if embedded.len() < total {
            tracing::warn!(
                request_id,
                embedded = embedded.len(),
                total,
                "some chunks were skipped"
            );
        }

        checkpoint(cancel, events, IngestStage::Indexing)?;
        let document = IndexedDocument {
            title: request.title.clone(),
            meta_text_desc: request.meta_text_desc.clone(),
            meta_key_words: request.meta_key_words.clone(),
            source_location: request.source_location.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            doc_chunks: embedded,
        };
        let document_id = self.index(cancel, request_id, index, &document).await?;

        enter(events, IngestStage::Complete);
        Ok(document_id)
    }

    async fn index(
        &self,
        cancel: &CancellationToken,
        request_id: &str,
        index: &str,
        document: &IndexedDocument,
    ) -> Result<String, PipelineError> {
        let wrap = |error: anyhow::Error| PipelineError::Search {
            step: "document indexing",
            error,
        };
        let created = self
            .indexer
            .ensure_index(index, self.dims)
            .await
            .map_err(|error| classify(cancel, request_id, "index provisioning", error, wrap))?;
        if created {
            tracing::info!(index, dims = self.dims, "created index");
        }
        let id = self
            .indexer
            .index_document(cancel, index, document)
            .await
            .map_err(|error| classify(cancel, request_id, "document indexing", error, wrap))?;
        tracing::info!(
            request_id,
            index,
            document_id = %id,
            chunks = document.doc_chunks.len(),
            "document indexed"
        );
        Ok(id)
    }
}
