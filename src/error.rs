//! Error taxonomy shared by the pipelines and the transport layer.
//!
//! Internal steps return `anyhow::Result` and annotate failures with
//! context. At the pipeline boundary every failure is folded into a
//! [`PipelineError`], whose [`ErrorCode`] is the only structured piece that
//! crosses into response events.

use serde::Serialize;
use std::path::PathBuf;

/// Machine-readable failure category attached to every failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Cancelled,
    EmbeddingFailed,
    SearchFailed,
    GenerationFailed,
    PersistenceFailed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::EmbeddingFailed => "embedding_failed",
            ErrorCode::SearchFailed => "search_failed",
            ErrorCode::GenerationFailed => "generation_failed",
            ErrorCode::PersistenceFailed => "persistence_failed",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker error for work abandoned because its operation token fired.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Failures from [`crate::process::run_process`].
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("executable not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to launch {}: {error}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{} timed out after {secs}s", .program.display())]
    TimedOut { program: PathBuf, secs: u64 },

    #[error("i/o error while running {}: {error}", .program.display())]
    Io {
        program: PathBuf,
        #[source]
        error: std::io::Error,
    },
}

/// Terminal failure of a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("{step} failed: {error:#}")]
    Embedding {
        step: &'static str,
        error: anyhow::Error,
    },

    #[error("{step} failed: {error:#}")]
    Search {
        step: &'static str,
        error: anyhow::Error,
    },

    #[error("completion generation failed: {0:#}")]
    Generation(anyhow::Error),

    #[error("persistence failed: {0:#}")]
    Persistence(anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::Validation(_) => ErrorCode::Validation,
            PipelineError::Cancelled => ErrorCode::Cancelled,
            PipelineError::Embedding { .. } => ErrorCode::EmbeddingFailed,
            PipelineError::Search { .. } => ErrorCode::SearchFailed,
            PipelineError::Generation(_) => ErrorCode::GenerationFailed,
            PipelineError::Persistence(_) => ErrorCode::PersistenceFailed,
            PipelineError::Internal(_) => ErrorCode::Internal,
        }
    }
}

/// True when `error` (or anything in its chain) reports a cancellation.
pub fn is_cancellation(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause.is::<Cancelled>() || matches!(cause.downcast_ref::<ProcessError>(), Some(ProcessError::Cancelled))
    })
}
