//! LLM backends.
//!
//! Every engine in the engine table is reached through a [`TextGenerator`]:
//! `local` engines talk to an Ollama endpoint, `api` engines to an
//! OpenAI-compatible chat completions endpoint.

mod error;
mod ollama;
mod openai;

pub use error::{LlmError, LlmErrorKind, RetryConfig};
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{Config, EngineConfig, EngineSource, EngineTable};

/// Turns a prompt into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Whether the backend can serve requests as configured.
    fn is_configured(&self) -> bool {
        true
    }

    async fn generate(&self, prompt: &str, model: &str) -> Result<String, LlmError>;
}

/// Reported state of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "locked")]
    Locked,
    #[serde(rename = "inactive (API key missing)")]
    MissingApiKey,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Active => "active",
            EngineStatus::Disabled => "disabled",
            EngineStatus::Locked => "locked",
            EngineStatus::MissingApiKey => "inactive (API key missing)",
        }
    }
}

/// A generator bound to the model an engine was configured with.
#[derive(Clone)]
pub struct EngineHandle {
    pub config: EngineConfig,
    pub generator: Arc<dyn TextGenerator>,
}

impl EngineHandle {
    pub async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.generator.generate(prompt, &self.config.model).await
    }

    pub fn status(&self) -> EngineStatus {
        if !self.config.toggle {
            EngineStatus::Disabled
        } else if self.config.locked {
            EngineStatus::Locked
        } else if !self.generator.is_configured() {
            EngineStatus::MissingApiKey
        } else {
            EngineStatus::Active
        }
    }
}

/// Engine name to backend lookup, built once at startup.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<String, EngineHandle>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one client per engine from the table and the endpoint settings in `config`.
    pub fn from_table(table: &EngineTable, config: &Config) -> Self {
        let mut registry = Self::new();
        for engine in &table.llm_engines {
            let generator: Arc<dyn TextGenerator> = match engine.source {
                EngineSource::Local => {
                    let base = engine.base_url.as_deref().unwrap_or(&config.ollama_url);
                    Arc::new(OllamaClient::new(base))
                }
                EngineSource::Api => {
                    let base = engine
                        .base_url
                        .as_deref()
                        .unwrap_or(&config.openai_base_url);
                    let client = OpenAiClient::new(base, config.openai_api_key.clone());
                    if !client.is_configured() {
                        tracing::warn!(
                            "OPENAI_API_KEY not set; engine '{}' is inactive",
                            engine.name
                        );
                    }
                    Arc::new(client)
                }
            };
            registry.register(engine.clone(), generator);
        }
        registry
    }

    pub fn register(&mut self, config: EngineConfig, generator: Arc<dyn TextGenerator>) {
        tracing::debug!(
            "Registered engine '{}' ({} / {})",
            config.name,
            generator.name(),
            config.model
        );
        self.engines
            .insert(config.name.clone(), EngineHandle { config, generator });
    }

    pub fn get(&self, name: &str) -> Option<&EngineHandle> {
        self.engines.get(name)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Status per engine, sorted by name.
    pub fn llm_status(&self) -> BTreeMap<String, EngineStatus> {
        self.engines
            .iter()
            .map(|(name, handle)| (name.clone(), handle.status()))
            .collect()
    }
}
