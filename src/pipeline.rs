//! The document query pipeline.
//!
//! A query runs through a fixed sequence of stages:
//!
//! ```text
//! Validating → Connecting → Embedding(keywords) → Embedding(prompt)
//!   → Searching(keywords) → Searching(prompt) → Deduplicating
//!   → Generating → Persisting → Complete
//! ```
//!
//! Before entering each stage the operation token is checked; a fired token
//! ends the run as [`Outcome::Cancelled`] without starting the stage. A
//! stage error ends the run as [`Outcome::Failed`] unless it was caused by
//! cancellation. Validation runs before the first cancellation check.
//!
//! Every run reports exactly one response through its [`RequestEvents`].
//! Progress reaches 100 only when the run succeeds. Persistence failures
//! are logged and do not fail the run.

use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::completion::Completer;
use crate::config::Config;
use crate::dedup::combine_context;
use crate::embedding::Embedder;
use crate::error::{is_cancellation, ErrorCode, PipelineError};
use crate::models::{QueryRequest, QuestionRecord};
use crate::progress::{RequestEvents, ResponseEvent};
use crate::prompt::{grounded_prompt, PromptRegistry};
use crate::search::VectorSearch;
use crate::store::QuestionStore;

/// Message carried by every cancellation response.
pub const CANCELLED_MESSAGE: &str = "Operation cancelled by user";

// ═══════════════════════════════════════════════════════════════════════
// Outcome
// ═══════════════════════════════════════════════════════════════════════

/// Terminal result of any pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { text: String },
    Cancelled,
    Failed { code: ErrorCode, message: String },
}

impl Outcome {
    pub fn from_result(result: Result<String, PipelineError>) -> Self {
        match result {
            Ok(text) => Outcome::Success { text },
            Err(PipelineError::Cancelled) => Outcome::Cancelled,
            Err(err) => Outcome::Failed {
                code: err.code(),
                message: err.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Cancelled => Some(ErrorCode::Cancelled),
            Outcome::Failed { code, .. } => Some(*code),
        }
    }

    pub fn to_response(&self, request_id: &str, elapsed: Duration) -> ResponseEvent {
        let (success, result, error) = match self {
            Outcome::Success { text } => (true, text.clone(), None),
            Outcome::Cancelled => (false, String::new(), Some(CANCELLED_MESSAGE.to_string())),
            Outcome::Failed { message, .. } => (false, String::new(), Some(message.clone())),
        };
        ResponseEvent {
            request_id: request_id.to_string(),
            success,
            result,
            error,
            code: self.code(),
            processing_time: elapsed.as_millis() as i64,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Stage plumbing shared by the pipelines
// ═══════════════════════════════════════════════════════════════════════

/// A reportable pipeline stage.
pub trait Stage: Copy {
    fn progress(&self) -> u8;
    fn status(&self) -> &'static str;
    fn message(&self) -> &'static str;
}

/// Checks the token, then reports entry into `stage`.
pub(crate) fn checkpoint<S: Stage>(
    cancel: &CancellationToken,
    events: &RequestEvents,
    stage: S,
) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    enter(events, stage);
    Ok(())
}

pub(crate) fn enter<S: Stage>(events: &RequestEvents, stage: S) {
    events.progress(stage.status(), stage.message(), stage.progress());
}

/// Maps a collaborator error to [`PipelineError::Cancelled`] when the
/// token fired or the error reports cancellation, otherwise through `wrap`.
pub(crate) fn classify(
    cancel: &CancellationToken,
    request_id: &str,
    step: &'static str,
    error: anyhow::Error,
    wrap: impl FnOnce(anyhow::Error) -> PipelineError,
) -> PipelineError {
    if cancel.is_cancelled() || is_cancellation(&error) {
        tracing::info!(request_id, step, "step interrupted by cancellation");
        return PipelineError::Cancelled;
    }
    tracing::error!(request_id, step, error = format!("{:#}", error), "step failed");
    wrap(error)
}

/// Runs `save` under `timeout`. Failures and timeouts are logged and
/// swallowed; only cancellation is reported back.
pub(crate) async fn persist_best_effort<F>(
    cancel: &CancellationToken,
    timeout: Duration,
    request_id: &str,
    save: F,
) -> Result<(), PipelineError>
where
    F: Future<Output = anyhow::Result<String>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::info!(request_id, "persistence abandoned by cancellation");
            Err(PipelineError::Cancelled)
        }
        result = tokio::time::timeout(timeout, save) => {
            match result {
                Ok(Ok(id)) => tracing::debug!(request_id, record_id = %id, "saved record"),
                Ok(Err(e)) => {
                    let err = PipelineError::Persistence(e);
                    tracing::warn!(request_id, error = %err, "record not saved");
                }
                Err(_) => tracing::warn!(
                    request_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "record not saved: persistence timed out"
                ),
            }
            Ok(())
        }
    }
}

/// Logs the outcome and emits the single response for the run.
pub(crate) fn finish(events: &RequestEvents, outcome: &Outcome, started: Instant) {
    let elapsed = started.elapsed();
    match outcome {
        Outcome::Success { .. } => tracing::info!(
            request_id = events.request_id(),
            elapsed_ms = elapsed.as_millis() as u64,
            "request completed"
        ),
        Outcome::Cancelled => tracing::info!(request_id = events.request_id(), "request cancelled"),
        Outcome::Failed { code, message } => tracing::warn!(
            request_id = events.request_id(),
            %code,
            %message,
            "request failed"
        ),
    }
    events.respond(outcome.to_response(events.request_id(), elapsed));
}

// ═══════════════════════════════════════════════════════════════════════
// Query pipeline
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    Validating,
    Connecting,
    EmbeddingKeywords,
    EmbeddingPrompt,
    SearchingKeywords,
    SearchingPrompt,
    Deduplicating,
    Generating,
    Persisting,
    Complete,
}

impl Stage for QueryStage {
    fn progress(&self) -> u8 {
        match self {
            QueryStage::Validating => 0,
            QueryStage::Connecting => 10,
            QueryStage::EmbeddingKeywords => 20,
            QueryStage::EmbeddingPrompt => 30,
            QueryStage::SearchingKeywords => 45,
            QueryStage::SearchingPrompt => 60,
            QueryStage::Deduplicating => 70,
            QueryStage::Generating => 80,
            QueryStage::Persisting => 95,
            QueryStage::Complete => 100,
        }
    }

    fn status(&self) -> &'static str {
        match self {
            QueryStage::Validating => "starting",
            QueryStage::Connecting => "connecting",
            QueryStage::EmbeddingKeywords | QueryStage::EmbeddingPrompt => "embedding",
            QueryStage::SearchingKeywords | QueryStage::SearchingPrompt => "searching",
            QueryStage::Deduplicating => "processing",
            QueryStage::Generating => "generating",
            QueryStage::Persisting => "saving",
            QueryStage::Complete => "complete",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            QueryStage::Validating => "Initializing document query...",
            QueryStage::Connecting => "Connecting to search backend...",
            QueryStage::EmbeddingKeywords => "Generating keyword embeddings...",
            QueryStage::EmbeddingPrompt => "Generating prompt embeddings...",
            QueryStage::SearchingKeywords => "Searching document with keyword embeddings...",
            QueryStage::SearchingPrompt => "Searching document with prompt embeddings...",
            QueryStage::Deduplicating => "Processing search results...",
            QueryStage::Generating => "Generating completion...",
            QueryStage::Persisting => "Saving question and response...",
            QueryStage::Complete => "Document query completed successfully",
        }
    }
}

/// Collaborators used by the query pipeline.
#[derive(Clone)]
pub struct QueryServices {
    pub embedder: Arc<dyn Embedder>,
    pub search: Arc<dyn VectorSearch>,
    pub completer: Arc<dyn Completer>,
    pub store: Arc<dyn QuestionStore>,
    pub prompts: Arc<PromptRegistry>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Inner hits requested per search.
    pub max_results: usize,
    pub persistence_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_results: config.search.max_results,
            persistence_timeout: Duration::from_secs(config.persistence.timeout_secs),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_results: 15,
            persistence_timeout: Duration::from_secs(5),
        }
    }
}

pub struct QueryPipeline {
    services: QueryServices,
    settings: PipelineSettings,
}

impl QueryPipeline {
    pub fn new(services: QueryServices, settings: PipelineSettings) -> Self {
        Self { services, settings }
    }

    /// Runs one query to completion and reports its response.
    pub async fn run(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
        events: &RequestEvents,
    ) -> Outcome {
        let started = Instant::now();
        let outcome = Outcome::from_result(self.execute(request, cancel, events, started).await);
        finish(events, &outcome, started);
        outcome
    }

    async fn execute(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
        events: &RequestEvents,
        started: Instant,
    ) -> Result<String, PipelineError> {
        let request_id = events.request_id();
        let services = &self.services;

        enter(events, QueryStage::Validating);
        request.validate()?;
        tracing::info!(
            request_id,
            index = %request.index_id,
            document = %request.document_id,
            "document query started"
        );

        checkpoint(cancel, events, QueryStage::Connecting)?;

        checkpoint(cancel, events, QueryStage::EmbeddingKeywords)?;
        let keyword_vector = services
            .embedder
            .embed(cancel, &request.embedding_args, &request.keyword_text())
            .await
            .map_err(|error| {
                classify(cancel, request_id, "keyword embedding", error, |error| {
                    PipelineError::Embedding {
                        step: "keyword embedding",
                        error,
                    }
                })
            })?;

        checkpoint(cancel, events, QueryStage::EmbeddingPrompt)?;
        let prompt_vector = services
            .embedder
            .embed(cancel, &request.embedding_args, &request.embedding_prompt)
            .await
            .map_err(|error| {
                classify(cancel, request_id, "prompt embedding", error, |error| {
                    PipelineError::Embedding {
                        step: "prompt embedding",
                        error,
                    }
                })
            })?;

        checkpoint(cancel, events, QueryStage::SearchingKeywords)?;
        let keyword_results = self
            .search(cancel, request, &keyword_vector, "keyword search")
            .await?;

        checkpoint(cancel, events, QueryStage::SearchingPrompt)?;
        let prompt_results = self
            .search(cancel, request, &prompt_vector, "prompt search")
            .await?;

        checkpoint(cancel, events, QueryStage::Deduplicating)?;
        let context = combine_context(&keyword_results, &prompt_results);
        tracing::debug!(
            request_id,
            keyword_bytes = keyword_results.len(),
            prompt_bytes = prompt_results.len(),
            context_bytes = context.len(),
            "merged search results"
        );
        let prompt = services
            .prompts
            .format(
                &request.prompt_type,
                &grounded_prompt(&request.document_prompt, &context),
            )
            .context("formatting grounded prompt")
            .map_err(PipelineError::Generation)?;

        checkpoint(cancel, events, QueryStage::Generating)?;
        let response = services
            .completer
            .complete(cancel, &request.completion_args, &prompt)
            .await
            .map_err(|error| {
                classify(
                    cancel,
                    request_id,
                    "completion",
                    error,
                    PipelineError::Generation,
                )
            })?;

        checkpoint(cancel, events, QueryStage::Persisting)?;
        let record = QuestionRecord {
            document_id: request.document_id.clone(),
            index_name: request.index_id.clone(),
            embed_prompt: request.embedding_prompt.clone(),
            doc_prompt: request.document_prompt.clone(),
            response: response.clone(),
            keywords: request.search_keywords.clone(),
            prompt_type: services.prompts.resolve(&request.prompt_type).to_string(),
            embedding_args: request.embedding_args.clone(),
            completion_args: request.completion_args.clone(),
            processing_time_ms: started.elapsed().as_millis() as i64,
        };
        persist_best_effort(
            cancel,
            self.settings.persistence_timeout,
            request_id,
            services.store.save_question(&record),
        )
        .await?;

        enter(events, QueryStage::Complete);
        Ok(response)
    }

    async fn search(
        &self,
        cancel: &CancellationToken,
        request: &QueryRequest,
        vector: &[f32],
        step: &'static str,
    ) -> Result<String, PipelineError> {
        self.services
            .search
            .search_document_chunks(
                cancel,
                &request.index_id,
                &request.document_id,
                vector,
                self.settings.max_results,
            )
            .await
            .map_err(|error| {
                classify(cancel, &request.request_id, step, error, |error| {
                    PipelineError::Search { step, error }
                })
            })
    }
}
