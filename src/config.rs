use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::prompt::PROMPT_PLACEHOLDER;

/// Environment variable that overrides `search.password`.
pub const SEARCH_PASSWORD_ENV: &str = "DQ_SEARCH_PASSWORD";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub search: SearchConfig,
    pub embedding: EmbeddingConfig,
    pub completion: CompletionConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_index")]
    pub default_index: String,
    /// Inner hits requested per document search.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_knn_k")]
    pub knn_k: usize,
    #[serde(default = "default_num_candidates")]
    pub num_candidates: usize,
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

fn default_index() -> String {
    "document-meta-index".to_string()
}
fn default_max_results() -> usize {
    15
}
fn default_knn_k() -> usize {
    5
}
fn default_num_candidates() -> usize {
    10
}
fn default_search_timeout() -> u64 {
    30
}

/// Static settings for the embedding executable. Per-request knobs live in
/// [`crate::models::EmbeddingOptions`].
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    pub binary: PathBuf,
    pub model: PathBuf,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_embedding_args")]
    pub args: Vec<String>,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

fn default_dims() -> usize {
    1024
}
fn default_embedding_args() -> Vec<String> {
    vec![
        "--embd-output-format".to_string(),
        "array".to_string(),
        "--log-disable".to_string(),
    ]
}
fn default_embedding_timeout() -> u64 {
    120
}

/// Static settings for the completion executable. Per-request knobs live in
/// [`crate::models::CompletionOptions`].
#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    pub binary: PathBuf,
    pub model: PathBuf,
    #[serde(default = "default_completion_args")]
    pub args: Vec<String>,
    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,
}

fn default_completion_args() -> Vec<String> {
    vec!["--no-display-prompt".to_string()]
}
fn default_completion_timeout() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    #[serde(default = "default_persistence_timeout")]
    pub timeout_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_persistence_timeout(),
        }
    }
}

fn default_persistence_timeout() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Tokens repeated from the end of the previous chunk.
    #[serde(default)]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: 0,
        }
    }
}

fn default_max_tokens() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptsConfig {
    #[serde(default = "default_prompt_type")]
    pub default_type: String,
    /// Extra templates keyed by prompt type. Each must contain `{prompt}`.
    #[serde(default)]
    pub templates: HashMap<String, String>,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            default_type: default_prompt_type(),
            templates: HashMap::new(),
        }
    }
}

fn default_prompt_type() -> String {
    "llama".to_string()
}

impl SearchConfig {
    /// Password from the environment when set, otherwise from the file.
    pub fn resolved_password(&self) -> Option<String> {
        std::env::var(SEARCH_PASSWORD_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .or_else(|| self.password.clone())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate search
    let url = config.search.url.as_str();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        anyhow::bail!("search.url must start with http:// or https://");
    }
    if config.search.max_results == 0 {
        anyhow::bail!("search.max_results must be > 0");
    }
    if config.search.knn_k == 0 {
        anyhow::bail!("search.knn_k must be > 0");
    }
    if config.search.num_candidates < config.search.knn_k {
        anyhow::bail!(
            "search.num_candidates ({}) must be >= search.knn_k ({})",
            config.search.num_candidates,
            config.search.knn_k
        );
    }
    if config.search.default_index.trim().is_empty() {
        anyhow::bail!("search.default_index must not be empty");
    }

    // Validate executables
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    for (name, secs) in [
        ("search.timeout_secs", config.search.timeout_secs),
        ("embedding.timeout_secs", config.embedding.timeout_secs),
        ("completion.timeout_secs", config.completion.timeout_secs),
        ("persistence.timeout_secs", config.persistence.timeout_secs),
    ] {
        if secs == 0 {
            anyhow::bail!("{} must be > 0", name);
        }
    }

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!(
            "chunking.overlap_tokens ({}) must be < chunking.max_tokens ({})",
            config.chunking.overlap_tokens,
            config.chunking.max_tokens
        );
    }

    // Validate prompt templates
    for (name, template) in &config.prompts.templates {
        if !template.contains(PROMPT_PLACEHOLDER) {
            anyhow::bail!(
                "prompts.templates.{} must contain the {} placeholder",
                name,
                PROMPT_PLACEHOLDER
            );
        }
    }
    let default_type = config.prompts.default_type.trim().to_lowercase();
    let configured = config
        .prompts
        .templates
        .keys()
        .any(|name| name.to_lowercase() == default_type);
    if !crate::prompt::is_builtin(&default_type) && !configured {
        anyhow::bail!(
            "prompts.default_type '{}' is neither a built-in nor a configured template",
            config.prompts.default_type
        );
    }

    Ok(())
}
