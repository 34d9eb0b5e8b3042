//! Text generation through the completion executable.
//!
//! The executable keeps a model resident on the GPU, so at most one
//! completion may run at a time across the whole process. [`ProcessCompleter`]
//! holds a [`CompletionGate`] for the full lifetime of each subprocess;
//! every completer built with [`ProcessCompleter::new`] shares the
//! process-wide gate.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::config::CompletionConfig;
use crate::embedding::push_opt;
use crate::error::ProcessError;
use crate::models::CompletionOptions;
use crate::process;

/// Turns a fully formatted prompt into generated text.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        options: &CompletionOptions,
        prompt: &str,
    ) -> Result<String>;
}

/// Single-flight lock around completion subprocesses.
#[derive(Clone)]
pub struct CompletionGate(Arc<Mutex<()>>);

impl CompletionGate {
    /// The gate shared by every completer in this process.
    pub fn global() -> Self {
        static GLOBAL: std::sync::OnceLock<CompletionGate> = std::sync::OnceLock::new();
        GLOBAL
            .get_or_init(|| CompletionGate(Arc::new(Mutex::new(()))))
            .clone()
    }

    /// A private gate, for isolating tests from one another.
    pub fn isolated() -> Self {
        CompletionGate(Arc::new(Mutex::new(())))
    }

    /// Waits for the gate unless `cancel` fires first.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, ()>, ProcessError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProcessError::Cancelled),
            guard = self.0.lock() => Ok(guard),
        }
    }
}

pub struct ProcessCompleter {
    config: CompletionConfig,
    gate: CompletionGate,
}

impl ProcessCompleter {
    pub fn new(config: CompletionConfig) -> Self {
        Self::with_gate(config, CompletionGate::global())
    }

    pub fn with_gate(config: CompletionConfig, gate: CompletionGate) -> Self {
        Self { config, gate }
    }

    /// Runs the executable with `args` under the gate and returns raw stdout.
    ///
    /// The gate is held until the subprocess has exited or been killed.
    pub async fn run(&self, cancel: &CancellationToken, args: &[String]) -> Result<Vec<u8>> {
        let waited = std::time::Instant::now();
        let _guard = self.gate.acquire(cancel).await?;
        tracing::debug!(
            waited_ms = waited.elapsed().as_millis() as u64,
            "acquired completion gate"
        );

        let output = process::run_process(
            cancel,
            &self.config.binary,
            args,
            Duration::from_secs(self.config.timeout_secs),
        )
        .await?;

        if !output.success() {
            bail!(
                "{} exited with {}: {}",
                self.config.binary.display(),
                output.status,
                output.stderr_tail()
            );
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Completer for ProcessCompleter {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        options: &CompletionOptions,
        prompt: &str,
    ) -> Result<String> {
        let args = completion_args(&self.config, options, prompt);
        let stdout = self.run(cancel, &args).await?;
        let text = String::from_utf8_lossy(&stdout).trim().to_string();
        if text.is_empty() {
            bail!("completion produced no output");
        }
        Ok(text)
    }
}

/// Argument list for one completion call. A flag is emitted only when its
/// option is set.
pub fn completion_args(
    config: &CompletionConfig,
    options: &CompletionOptions,
    prompt: &str,
) -> Vec<String> {
    let model = options.model.as_ref().unwrap_or(&config.model);
    let mut args = vec![
        "-m".to_string(),
        model.display().to_string(),
        "-p".to_string(),
        prompt.to_string(),
    ];

    push_opt(&mut args, "-c", options.ctx_size);
    push_opt(&mut args, "--temp", options.temperature);
    push_opt(&mut args, "--top-k", options.top_k);
    push_opt(&mut args, "--top-p", options.top_p);
    push_opt(&mut args, "--repeat-penalty", options.repeat_penalty);
    push_opt(&mut args, "-n", options.predict);
    push_opt(&mut args, "-t", options.threads);
    push_opt(&mut args, "-ngl", options.gpu_layers);
    push_opt(&mut args, "--seed", options.seed);
    push_opt(&mut args, "--chat-template", options.chat_template.as_deref());

    args.extend(config.args.iter().cloned());
    args.extend(options.extra.iter().cloned());
    args
}
