//! Request dispatch.
//!
//! [`App`] owns the pipelines and the operation registry. Each submitted
//! request runs on its own task with its own operation context; a
//! supervisor task waits for it, turns a panic into an `internal` failure
//! response (unless the request already responded), and releases the
//! operation when the run is over.

use anyhow::Result;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cancel::OperationRegistry;
use crate::completion::{Completer, ProcessCompleter};
use crate::config::Config;
use crate::embedding::{Embedder, ProcessEmbedder};
use crate::error::{ErrorCode, PipelineError};
use crate::inference::InferencePipeline;
use crate::ingest::IngestPipeline;
use crate::models::{
    decode_payload, parse_payload, payload_request_id, CompletionRequest, DocumentAddRequest,
    QueryRequest, StoredInference, StoredQuestion,
};
use crate::pipeline::{Outcome, PipelineSettings, QueryPipeline, QueryServices};
use crate::progress::{Channel, EventSink, RequestEvents};
use crate::prompt::PromptRegistry;
use crate::search::{
    DocumentCatalog, DocumentFilter, DocumentIndexer, DocumentSummary, ElasticsearchClient,
    VectorSearch,
};
use crate::store::{QuestionStore, SqliteStore};

/// Everything the pipelines talk to.
#[derive(Clone)]
pub struct Services {
    pub embedder: Arc<dyn Embedder>,
    pub search: Arc<dyn VectorSearch>,
    pub indexer: Arc<dyn DocumentIndexer>,
    pub catalog: Arc<dyn DocumentCatalog>,
    pub completer: Arc<dyn Completer>,
    pub store: Arc<dyn QuestionStore>,
    pub prompts: Arc<PromptRegistry>,
}

#[derive(Debug, Clone)]
pub struct AppSettings {
    pub pipeline: PipelineSettings,
    pub default_index: String,
    pub embedding_dims: usize,
    pub chunk_tokens: usize,
    pub chunk_overlap: usize,
}

impl AppSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pipeline: PipelineSettings::from_config(config),
            default_index: config.search.default_index.clone(),
            embedding_dims: config.embedding.dims,
            chunk_tokens: config.chunking.max_tokens,
            chunk_overlap: config.chunking.overlap_tokens,
        }
    }
}

/// A dispatched request.
pub struct Ticket {
    pub request_id: String,
    pub operation_id: String,
    handle: JoinHandle<Outcome>,
}

impl Ticket {
    /// Waits for the run to finish.
    pub async fn wait(self) -> Outcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) => Outcome::Failed {
                code: ErrorCode::Internal,
                message: format!("internal error: supervisor failed: {}", err),
            },
        }
    }
}

pub struct App {
    query: Arc<QueryPipeline>,
    inference: Arc<InferencePipeline>,
    ingest: Arc<IngestPipeline>,
    store: Arc<dyn QuestionStore>,
    catalog: Arc<dyn DocumentCatalog>,
    default_index: String,
    operations: Arc<OperationRegistry>,
    events: Arc<dyn EventSink>,
}

impl App {
    pub fn new(services: Services, settings: AppSettings, events: Arc<dyn EventSink>) -> Self {
        let query = QueryPipeline::new(
            QueryServices {
                embedder: services.embedder.clone(),
                search: services.search.clone(),
                completer: services.completer.clone(),
                store: services.store.clone(),
                prompts: services.prompts.clone(),
            },
            settings.pipeline.clone(),
        );
        let inference = InferencePipeline::new(
            services.completer.clone(),
            services.store.clone(),
            services.prompts.clone(),
            settings.pipeline.persistence_timeout,
        );
        let ingest = IngestPipeline::new(
            services.embedder.clone(),
            services.indexer.clone(),
            settings.default_index.clone(),
            settings.embedding_dims,
            settings.chunk_tokens,
        )
        .with_overlap(settings.chunk_overlap);
        Self {
            query: Arc::new(query),
            inference: Arc::new(inference),
            ingest: Arc::new(ingest),
            store: services.store,
            catalog: services.catalog,
            default_index: settings.default_index,
            operations: Arc::new(OperationRegistry::new()),
            events,
        }
    }

    /// Wires the subprocess, Elasticsearch and SQLite collaborators from
    /// configuration.
    pub async fn from_config(config: &Config, events: Arc<dyn EventSink>) -> Result<Self> {
        let search = Arc::new(ElasticsearchClient::new(&config.search)?);
        let store = Arc::new(SqliteStore::open(&config.db).await?);
        let services = Services {
            embedder: Arc::new(ProcessEmbedder::new(config.embedding.clone())),
            search: search.clone(),
            indexer: search.clone(),
            catalog: search,
            completer: Arc::new(ProcessCompleter::new(config.completion.clone())),
            store,
            prompts: Arc::new(PromptRegistry::from_config(&config.prompts)),
        };
        Ok(Self::new(services, AppSettings::from_config(config), events))
    }

    // ============ Submission ============

    /// Decodes and dispatches a query payload. A payload that does not
    /// decode gets a validation failure response and is not dispatched.
    pub fn submit_query(&self, payload: serde_json::Value) -> Result<Ticket, PipelineError> {
        let request = self.decode(Channel::QueryDocument, payload)?;
        Ok(self.dispatch_query(request))
    }

    pub fn submit_completion(&self, payload: serde_json::Value) -> Result<Ticket, PipelineError> {
        let request = self.decode(Channel::InferenceCompletion, payload)?;
        Ok(self.dispatch_completion(request))
    }

    pub fn submit_document(&self, payload: serde_json::Value) -> Result<Ticket, PipelineError> {
        let request = self.decode(Channel::AddDocument, payload)?;
        Ok(self.dispatch_document(request))
    }

    /// Submits a raw request body for `channel`. A body that is not JSON is
    /// rejected the same way as one that does not decode.
    pub fn submit_body(&self, channel: Channel, body: &[u8]) -> Result<Ticket, PipelineError> {
        let payload = parse_payload(body).map_err(|err| self.reject(channel, "", err))?;
        match channel {
            Channel::QueryDocument => self.submit_query(payload),
            Channel::InferenceCompletion => self.submit_completion(payload),
            Channel::AddDocument => self.submit_document(payload),
        }
    }

    pub fn dispatch_query(&self, request: QueryRequest) -> Ticket {
        let pipeline = self.query.clone();
        let request_id = request.request_id.clone();
        self.spawn_supervised(Channel::QueryDocument, request_id, move |cancel, events| async move {
            pipeline.run(&request, &cancel, &events).await
        })
    }

    pub fn dispatch_completion(&self, request: CompletionRequest) -> Ticket {
        let pipeline = self.inference.clone();
        let request_id = request.request_id.clone();
        self.spawn_supervised(
            Channel::InferenceCompletion,
            request_id,
            move |cancel, events| async move { pipeline.run(&request, &cancel, &events).await },
        )
    }

    pub fn dispatch_document(&self, request: DocumentAddRequest) -> Ticket {
        let pipeline = self.ingest.clone();
        let request_id = request.request_id.clone();
        self.spawn_supervised(Channel::AddDocument, request_id, move |cancel, events| async move {
            pipeline.run(&request, &cancel, &events).await
        })
    }

    fn decode<T: serde::de::DeserializeOwned>(
        &self,
        channel: Channel,
        payload: serde_json::Value,
    ) -> Result<T, PipelineError> {
        let request_id = payload_request_id(&payload);
        decode_payload(payload).map_err(|err| self.reject(channel, &request_id, err))
    }

    /// Answers an undecodable request with a validation failure.
    fn reject(&self, channel: Channel, request_id: &str, err: PipelineError) -> PipelineError {
        tracing::warn!(request_id, error = %err, "rejected request payload");
        let events = RequestEvents::new(self.events.clone(), channel, request_id.to_string());
        events.respond(
            Outcome::from_result(Err(PipelineError::Validation(err.to_string())))
                .to_response(request_id, Duration::ZERO),
        );
        err
    }

    fn spawn_supervised<F, Fut>(&self, channel: Channel, request_id: String, run: F) -> Ticket
    where
        F: FnOnce(CancellationToken, Arc<RequestEvents>) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let started = Instant::now();
        let operation_id = if request_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            request_id.clone()
        };
        let guard = self.operations.begin(&operation_id);
        let events = Arc::new(RequestEvents::new(
            self.events.clone(),
            channel,
            request_id.clone(),
        ));
        tracing::debug!(operation_id = %operation_id, event = channel.progress_event(), "dispatching");

        let work = tokio::spawn(run(guard.token().clone(), events.clone()));
        let handle = tokio::spawn(async move {
            let outcome = match work.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let outcome = if err.is_panic() {
                        let message = panic_message(err.into_panic());
                        tracing::error!(
                            request_id = events.request_id(),
                            panic = %message,
                            "pipeline task panicked"
                        );
                        Outcome::Failed {
                            code: ErrorCode::Internal,
                            message: format!("internal error: {}", message),
                        }
                    } else {
                        Outcome::Cancelled
                    };
                    if !events.respond(outcome.to_response(events.request_id(), started.elapsed()))
                    {
                        tracing::debug!("panic after response, nothing more to report");
                    }
                    outcome
                }
            };
            drop(guard);
            outcome
        });

        Ticket {
            request_id,
            operation_id,
            handle,
        }
    }

    // ============ Operations ============

    /// Cancels one in-flight operation by ID.
    pub fn cancel(&self, operation_id: &str) -> bool {
        self.operations.cancel(operation_id)
    }

    pub fn cancel_all(&self) -> usize {
        self.operations.cancel_all()
    }

    pub fn active_operations(&self) -> Vec<String> {
        self.operations.active()
    }

    /// Cancels everything, including operations dispatched from now on.
    pub fn shutdown(&self) {
        tracing::info!("shutting down, cancelling all operations");
        self.operations.shutdown();
    }

    pub async fn recent_questions(
        &self,
        document_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<StoredQuestion>> {
        self.store.recent_questions(document_id, limit).await
    }

    pub async fn recent_inferences(&self, limit: i64) -> Result<Vec<StoredInference>> {
        self.store.recent_inferences(limit).await
    }

    /// Looks documents up by title and metadata in `index`, or in the
    /// default index. Runs as a cancellable operation of its own.
    pub async fn find_documents(
        &self,
        index: Option<&str>,
        filter: &DocumentFilter,
    ) -> Result<Vec<DocumentSummary>> {
        let index = index
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .unwrap_or(&self.default_index);
        let guard = self.operations.begin(&uuid::Uuid::new_v4().to_string());
        tracing::debug!(operation_id = guard.operation_id(), index, ?filter, "document lookup");
        self.catalog.find_documents(guard.token(), index, filter).await
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
