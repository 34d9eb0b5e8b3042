//! Prompt templates keyed by prompt type.
//!
//! A template is plain text with a single `{prompt}` slot. Unknown or empty
//! prompt types fall back to the configured default.

use anyhow::{bail, Result};
use std::collections::HashMap;

use crate::config::PromptsConfig;

pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

const BUILTIN: &[(&str, &str)] = &[
    ("llama", "[INST] {prompt} [/INST]"),
    ("mistral", "[INST] {prompt} [/INST]"),
    (
        "llama3",
        "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\n{prompt}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n",
    ),
    (
        "chatml",
        "<|im_start|>user\n{prompt}<|im_end|>\n<|im_start|>assistant\n",
    ),
    ("raw", "{prompt}"),
];

pub fn is_builtin(prompt_type: &str) -> bool {
    BUILTIN.iter().any(|(name, _)| *name == prompt_type)
}

#[derive(Debug, Clone)]
pub struct PromptRegistry {
    templates: HashMap<String, String>,
    default_type: String,
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::from_config(&PromptsConfig::default())
    }
}

impl PromptRegistry {
    /// Built-in templates plus the configured ones. Configured templates
    /// replace built-ins of the same name.
    pub fn from_config(config: &PromptsConfig) -> Self {
        let mut templates: HashMap<String, String> = BUILTIN
            .iter()
            .map(|(name, template)| (name.to_string(), template.to_string()))
            .collect();
        for (name, template) in &config.templates {
            templates.insert(name.to_lowercase(), template.clone());
        }
        Self {
            templates,
            default_type: config.default_type.trim().to_lowercase(),
        }
    }

    /// Prompt type actually used for `requested`, as its lowercase
    /// registered name.
    pub fn resolve(&self, requested: &str) -> &str {
        match self.templates.get_key_value(&requested.trim().to_lowercase()) {
            Some((key, _)) => key,
            None => &self.default_type,
        }
    }

    pub fn format(&self, prompt_type: &str, raw: &str) -> Result<String> {
        if raw.trim().is_empty() {
            bail!("cannot format an empty prompt");
        }
        let key = self.resolve(prompt_type);
        let Some(template) = self.templates.get(key) else {
            bail!("no template registered for prompt type '{}'", key);
        };
        if prompt_type.trim().to_lowercase() != key {
            tracing::debug!(requested = prompt_type, used = %key, "unknown prompt type, using default");
        }
        Ok(template.replace(PROMPT_PLACEHOLDER, raw))
    }

    pub fn types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// The question followed by the retrieved context.
pub fn grounded_prompt(document_prompt: &str, context: &str) -> String {
    format!("{}\n\nContext: {}\n\n", document_prompt, context)
}
