//! Embedding generation through an external executable.
//!
//! Defines the [`Embedder`] trait and its subprocess implementation:
//! - **[`ProcessEmbedder`]** runs a llama.cpp-style embedding binary via
//!   [`crate::process::run_process`] and parses the printed vector.
//!
//! Also provides helpers shared with the search backends:
//! - [`embedding_args`] builds the argument list from static config plus per-request options
//! - [`parse_embedding_output`] turns subprocess output into one flat vector
//! - [`cosine_similarity`] compares two vectors
//!
//! # Output Format
//!
//! The executable prints either a nested array (one row per input prompt)
//! or a flat array. Only the first row of a nested array is used. Log noise
//! around the array is tolerated: the last line starting with `[` that
//! parses as an array wins, so bracketed log prefixes such as `[INFO]` on
//! earlier lines are skipped.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::EmbeddingConfig;
use crate::models::EmbeddingOptions;
use crate::process;

/// Turns text into a vector.
///
/// Implementations must return an error whose chain contains
/// [`crate::error::Cancelled`] or [`crate::error::ProcessError::Cancelled`]
/// when `cancel` fires, so callers can tell cancellation from failure.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(
        &self,
        cancel: &CancellationToken,
        options: &EmbeddingOptions,
        text: &str,
    ) -> Result<Vec<f32>>;
}

// ============ Process Embedder ============

pub struct ProcessEmbedder {
    config: EmbeddingConfig,
}

impl ProcessEmbedder {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Embedder for ProcessEmbedder {
    async fn embed(
        &self,
        cancel: &CancellationToken,
        options: &EmbeddingOptions,
        text: &str,
    ) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            bail!("cannot embed empty text");
        }

        let args = embedding_args(&self.config, options, text);
        let output = process::run_process(
            cancel,
            &self.config.binary,
            &args,
            Duration::from_secs(self.config.timeout_secs),
        )
        .await?;

        let vector = match parse_embedding_output(&output.stdout) {
            Ok(vector) => vector,
            Err(e) if !output.success() => bail!(
                "{} exited with {}: {} ({})",
                self.config.binary.display(),
                output.status,
                output.stderr_tail(),
                e
            ),
            Err(e) => return Err(e),
        };

        if vector.len() != self.config.dims {
            bail!(
                "embedding has {} dimensions, expected {}",
                vector.len(),
                self.config.dims
            );
        }

        tracing::debug!(
            dims = vector.len(),
            elapsed_ms = output.elapsed.as_millis() as u64,
            "generated embedding"
        );
        Ok(vector)
    }
}

/// Argument list for one embedding call. A flag is emitted only when its
/// option is set. `options` is never modified.
pub fn embedding_args(
    config: &EmbeddingConfig,
    options: &EmbeddingOptions,
    text: &str,
) -> Vec<String> {
    let model = options.model.as_ref().unwrap_or(&config.model);
    let mut args = vec![
        "-m".to_string(),
        model.display().to_string(),
        "-p".to_string(),
        text.to_string(),
    ];

    push_opt(&mut args, "-c", options.ctx_size);
    push_opt(&mut args, "-b", options.batch_size);
    push_opt(&mut args, "--pooling", options.pooling.as_deref());
    push_opt(&mut args, "--embd-normalize", options.normalize);
    push_opt(&mut args, "-t", options.threads);

    args.extend(config.args.iter().cloned());
    args.extend(options.extra.iter().cloned());
    args
}

pub(crate) fn push_opt<T: ToString>(args: &mut Vec<String>, flag: &str, value: Option<T>) {
    if let Some(value) = value {
        let value = value.to_string();
        if !value.is_empty() {
            args.push(flag.to_string());
            args.push(value);
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingPayload {
    Nested(Vec<Vec<f32>>),
    Flat(Vec<f32>),
}

/// Parse embedding subprocess output into a flat vector.
pub fn parse_embedding_output(raw: &[u8]) -> Result<Vec<f32>> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();

    let payload = match serde_json::from_str::<EmbeddingPayload>(text) {
        Ok(payload) => payload,
        Err(err) => {
            let candidates: Vec<&str> = text
                .lines()
                .map(str::trim)
                .filter(|line| line.starts_with('['))
                .collect();
            if candidates.is_empty() {
                bail!("embedding output contains no array");
            }
            candidates
                .into_iter()
                .rev()
                .find_map(|line| serde_json::from_str::<EmbeddingPayload>(line).ok())
                .ok_or(err)
                .context("embedding output is not a numeric array")?
        }
    };

    let vector = match payload {
        EmbeddingPayload::Nested(rows) => rows.into_iter().next().unwrap_or_default(),
        EmbeddingPayload::Flat(vector) => vector,
    };
    if vector.is_empty() {
        bail!("embedding output is empty");
    }
    Ok(vector)
}

/// Cosine similarity in `[-1, 1]`. Mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
