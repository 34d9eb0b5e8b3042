//! Core data types: inbound requests, per-request generation options, and
//! the records handed to the persistence layer.
//!
//! Requests arrive as loosely-typed JSON from the event transport and are
//! decoded exactly once through [`decode_payload`], which yields either a
//! typed request or a [`PipelineError::Validation`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::PipelineError;

/// Source formats accepted by the document ingestion pipeline.
pub const EMBEDDING_TYPE_TEXT: &str = "text";
pub const EMBEDDING_TYPE_PDF: &str = "pdf";
pub const EMBEDDING_TYPE_CSV: &str = "csv";

/// Per-request knobs for the embedding executable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingOptions {
    pub model: Option<PathBuf>,
    pub ctx_size: Option<u32>,
    pub batch_size: Option<u32>,
    /// `none`, `mean`, `cls`, `last`, or `rank`.
    pub pooling: Option<String>,
    /// `--embd-normalize` value (-1 none, 0 max-abs, 1 taxicab, 2 euclidean).
    pub normalize: Option<i32>,
    pub threads: Option<u32>,
    pub extra: Vec<String>,
}

/// Per-request knobs for the completion executable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionOptions {
    pub model: Option<PathBuf>,
    pub ctx_size: Option<u32>,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub repeat_penalty: Option<f32>,
    /// Maximum tokens to generate.
    pub predict: Option<i32>,
    pub threads: Option<u32>,
    pub gpu_layers: Option<u32>,
    pub seed: Option<i64>,
    pub chat_template: Option<String>,
    pub extra: Vec<String>,
}

/// One user question scoped to a single indexed document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryRequest {
    pub request_id: String,
    pub index_id: String,
    pub document_id: String,
    pub embedding_prompt: String,
    pub document_prompt: String,
    pub prompt_type: String,
    pub search_keywords: Vec<String>,
    #[serde(alias = "llamaEmbedArgs")]
    pub embedding_args: EmbeddingOptions,
    #[serde(alias = "llamaCliArgs")]
    pub completion_args: CompletionOptions,
}

impl QueryRequest {
    /// Checks every required field. Runs before any cancellation check or
    /// collaborator call.
    pub fn validate(&self) -> Result<(), PipelineError> {
        require("indexId", &self.index_id)?;
        require("documentId", &self.document_id)?;
        require("embeddingPrompt", &self.embedding_prompt)?;
        require("documentPrompt", &self.document_prompt)?;
        if self.search_keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(PipelineError::Validation(
                "searchKeywords must contain at least one keyword".to_string(),
            ));
        }
        Ok(())
    }

    /// Keywords joined with single spaces, blanks dropped.
    pub fn keyword_text(&self) -> String {
        self.search_keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A plain completion with no retrieval step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionRequest {
    pub request_id: String,
    pub prompt_text: String,
    pub prompt_type: String,
    #[serde(alias = "llamaCliArgs")]
    pub completion_args: CompletionOptions,
}

impl CompletionRequest {
    pub fn validate(&self) -> Result<(), PipelineError> {
        require("promptText", &self.prompt_text)
    }
}

/// Adds one source file to a search index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentAddRequest {
    pub request_id: String,
    pub index_name: String,
    pub title: String,
    pub meta_text_desc: String,
    pub meta_key_words: String,
    pub source_location: String,
    pub embedding_type: String,
    /// Chunk size in tokens; falls back to `chunking.max_tokens`.
    pub chunk_size: Option<usize>,
    /// Tokens carried over from the previous chunk; falls back to
    /// `chunking.overlap_tokens`.
    pub chunk_overlap: Option<usize>,
    #[serde(alias = "embeddingArguments", alias = "llamaEmbedArgs")]
    pub embedding_args: EmbeddingOptions,
}

impl DocumentAddRequest {
    pub fn validate(&self) -> Result<(), PipelineError> {
        require("title", &self.title)?;
        require("sourceLocation", &self.source_location)?;
        match self.embedding_type.as_str() {
            EMBEDDING_TYPE_TEXT | EMBEDDING_TYPE_PDF | EMBEDDING_TYPE_CSV => {}
            "" => {
                return Err(PipelineError::Validation(
                    "embeddingType must not be empty".to_string(),
                ))
            }
            other => {
                return Err(PipelineError::Validation(format!(
                    "unsupported embeddingType '{}' (expected text, pdf or csv)",
                    other
                )))
            }
        }
        if self.chunk_size == Some(0) {
            return Err(PipelineError::Validation(
                "chunkSize must be > 0".to_string(),
            ));
        }
        if let (Some(size), Some(overlap)) = (self.chunk_size, self.chunk_overlap) {
            if overlap >= size {
                return Err(PipelineError::Validation(format!(
                    "chunkOverlap ({}) must be smaller than chunkSize ({})",
                    overlap, size
                )));
            }
        }
        Ok(())
    }
}

fn require(field: &str, value: &str) -> Result<(), PipelineError> {
    if value.trim().is_empty() {
        return Err(PipelineError::Validation(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(())
}

/// Decodes a transport payload into a typed request in one step.
pub fn decode_payload<T: DeserializeOwned>(payload: serde_json::Value) -> Result<T, PipelineError> {
    serde_json::from_value(payload)
        .map_err(|e| PipelineError::Validation(format!("malformed request payload: {}", e)))
}

/// Parses a raw request body as JSON.
pub fn parse_payload(body: &[u8]) -> Result<serde_json::Value, PipelineError> {
    serde_json::from_slice(body)
        .map_err(|e| PipelineError::Validation(format!("request body is not JSON: {}", e)))
}

/// Best-effort request ID from a payload that may not decode.
pub fn payload_request_id(payload: &serde_json::Value) -> String {
    payload
        .get("requestId")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// The persisted outcome of a document query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRecord {
    pub document_id: String,
    pub index_name: String,
    pub embed_prompt: String,
    pub doc_prompt: String,
    pub response: String,
    pub keywords: Vec<String>,
    pub prompt_type: String,
    pub embedding_args: EmbeddingOptions,
    pub completion_args: CompletionOptions,
    pub processing_time_ms: i64,
}

/// The persisted outcome of a plain completion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRecord {
    pub question: String,
    pub response: String,
    pub prompt_type: String,
    pub completion_args: CompletionOptions,
    pub processing_time_ms: i64,
}

/// A question record read back from storage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredQuestion {
    pub id: String,
    pub document_id: String,
    pub index_name: String,
    pub embed_prompt: String,
    pub doc_prompt: String,
    pub response: String,
    pub keywords: Vec<String>,
    pub prompt_type: String,
    pub created_at: DateTime<Utc>,
    pub processing_time_ms: i64,
}

/// A plain completion read back from storage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredInference {
    pub id: String,
    pub question: String,
    pub response: String,
    pub prompt_type: String,
    pub completion_args: CompletionOptions,
    pub created_at: DateTime<Utc>,
    pub processing_time_ms: i64,
}
