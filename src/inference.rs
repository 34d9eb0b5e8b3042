//! Plain completions without retrieval.
//!
//! Same contract as the query pipeline: validation first, a cancellation
//! checkpoint before each stage, one response per run, best-effort
//! persistence.

use anyhow::Context;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::completion::Completer;
use crate::error::PipelineError;
use crate::models::{CompletionRequest, InferenceRecord};
use crate::pipeline::{checkpoint, classify, enter, finish, persist_best_effort, Outcome, Stage};
use crate::progress::RequestEvents;
use crate::prompt::PromptRegistry;
use crate::store::QuestionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceStage {
    Starting,
    Processing,
    Generating,
    Saving,
    Complete,
}

impl Stage for InferenceStage {
    fn progress(&self) -> u8 {
        match self {
            InferenceStage::Starting => 0,
            InferenceStage::Processing => 20,
            InferenceStage::Generating => 50,
            InferenceStage::Saving => 80,
            InferenceStage::Complete => 100,
        }
    }

    fn status(&self) -> &'static str {
        match self {
            InferenceStage::Starting => "starting",
            InferenceStage::Processing => "processing",
            InferenceStage::Generating => "generating",
            InferenceStage::Saving => "saving",
            InferenceStage::Complete => "complete",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            InferenceStage::Starting => "Initializing completion...",
            InferenceStage::Processing => "Formatting prompt...",
            InferenceStage::Generating => "Generating completion...",
            InferenceStage::Saving => "Saving completion...",
            InferenceStage::Complete => "Completion finished successfully",
        }
    }
}

pub struct InferencePipeline {
    completer: Arc<dyn Completer>,
    store: Arc<dyn QuestionStore>,
    prompts: Arc<PromptRegistry>,
    persistence_timeout: Duration,
}

impl InferencePipeline {
    pub fn new(
        completer: Arc<dyn Completer>,
        store: Arc<dyn QuestionStore>,
        prompts: Arc<PromptRegistry>,
        persistence_timeout: Duration,
    ) -> Self {
        Self {
            completer,
            store,
            prompts,
            persistence_timeout,
        }
    }

    pub async fn run(
        &self,
        request: &CompletionRequest,
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
        request: &CompletionRequest,
        cancel: &CancellationToken,
        events: &RequestEvents,
        started: Instant,
    ) -> Result<String, PipelineError> {
        let request_id = events.request_id();

        enter(events, InferenceStage::Starting);
        request.validate()?;

        checkpoint(cancel, events, InferenceStage::Processing)?;
        let prompt = self
            .prompts
            .format(&request.prompt_type, &request.prompt_text)
            .context("formatting prompt")
            .map_err(PipelineError::Generation)?;

        checkpoint(cancel, events, InferenceStage::Generating)?;
        let response = self
            .completer
            .complete(cancel, &request.completion_args, &prompt)
            .await
            .map_err(|error| {
                classify(cancel, request_id, "completion", error, PipelineError::Generation)
            })?;

        checkpoint(cancel, events, InferenceStage::Saving)?;
        let record = InferenceRecord {
            question: request.prompt_text.clone(),
            response: response.clone(),
            prompt_type: self.prompts.resolve(&request.prompt_type).to_string(),
            completion_args: request.completion_args.clone(),
            processing_time_ms: started.elapsed().as_millis() as i64,
        };
        persist_best_effort(
            cancel,
            self.persistence_timeout,
            request_id,
            self.store.save_inference(&record),
        )
        .await?;

        enter(events, InferenceStage::Complete);
        Ok(response)
    }
}
