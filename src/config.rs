//! Configuration management for the agent server.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `ENGINES_CONFIG` - Optional. Engine table (JSON or YAML). Defaults to `config/engines.json`.
//! - `TASK_STORE` - Optional. `memory` or `file`. Defaults to `file`.
//! - `TASK_STATE_DIR` - Optional. Root of the file task store. Defaults to `data/tasks`.
//! - `BUS_BACKEND` - Optional. `memory` or `file`. Defaults to `file`.
//! - `BUS_DIR` - Optional. Root of the file broker. Defaults to `data/bus`.
//! - `BUS_NACK_POLICY` - Optional. `drop`, `requeue` or `dead_letter`. Defaults to `drop`.
//! - `MAX_CONCURRENT_AGENTS` - Optional. Worker pool size for agent executions. Defaults to `8`.
//! - `LLM_TIMEOUT_SECS` - Optional. Timeout for a single backend call. Defaults to `120`.
//! - `CONFIDENCE_THRESHOLD` - Optional. Below this, requests are routed to Chat. Defaults to `0.7`.
//! - `OLLAMA_URL` - Optional. Local engine endpoint. Defaults to `http://localhost:11434`.
//! - `OPENAI_API_KEY` - Optional. Key for `api` engines.
//! - `OPENAI_BASE_URL` - Optional. Defaults to `https://api.openai.com/v1`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::bus::NackPolicy;
use crate::task_state::TaskStoreType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid load balancer rule #{index} ({condition}): {message}")]
    InvalidRule {
        index: usize,
        condition: String,
        message: String,
    },
}

/// Bus broker backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusBackend {
    Memory,
    #[default]
    File,
}

impl BusBackend {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => Self::Memory,
            "file" | "disk" => Self::File,
            _ => Self::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Path of the engine table / load balancer rules file
    pub engines_path: PathBuf,

    /// Task store backend
    pub task_store: TaskStoreType,

    /// Root directory for the file task store
    pub task_state_dir: PathBuf,

    /// Bus broker backend
    pub bus_backend: BusBackend,

    /// Root directory for the file broker
    pub bus_dir: PathBuf,

    /// What happens to a message whose handler nacks it
    pub nack_policy: NackPolicy,

    /// Upper bound on concurrently running agent executions
    pub max_concurrent_agents: usize,

    /// Timeout for one backend `generate` call
    pub llm_timeout: Duration,

    /// Classifier confidence below which requests fall back to Chat
    pub confidence_threshold: f64,

    /// Local (Ollama) endpoint
    pub ollama_url: String,

    /// API key for `api` engines
    pub openai_api_key: Option<String>,

    /// Base URL for `api` engines
    pub openai_base_url: String,

    /// Directory the File-Indexing-Agent may walk
    pub index_root: PathBuf,

    /// Files listed per indexing request
    pub index_max_files: usize,

    /// Files larger than this are listed without content
    pub index_max_file_bytes: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = parse_env("PORT", 3000u16)?;

        let engines_path = std::env::var("ENGINES_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/engines.json"));

        let task_store = std::env::var("TASK_STORE")
            .map(|v| TaskStoreType::from_str(&v))
            .unwrap_or_default();

        let task_state_dir = std::env::var("TASK_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/tasks"));

        let bus_backend = std::env::var("BUS_BACKEND")
            .map(|v| BusBackend::from_str(&v))
            .unwrap_or_default();

        let bus_dir = std::env::var("BUS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/bus"));

        let nack_policy = match std::env::var("BUS_NACK_POLICY") {
            Ok(v) => NackPolicy::parse(&v)
                .ok_or_else(|| ConfigError::InvalidValue("BUS_NACK_POLICY".to_string(), v))?,
            Err(_) => NackPolicy::default(),
        };

        let max_concurrent_agents = parse_env("MAX_CONCURRENT_AGENTS", 8usize)?;
        if max_concurrent_agents == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_CONCURRENT_AGENTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let llm_timeout = Duration::from_secs(parse_env("LLM_TIMEOUT_SECS", 120u64)?);

        let confidence_threshold = parse_env("CONFIDENCE_THRESHOLD", 0.7f64)?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(ConfigError::InvalidValue(
                "CONFIDENCE_THRESHOLD".to_string(),
                format!("{} is outside [0, 1]", confidence_threshold),
            ));
        }

        let ollama_url =
            std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string());

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let openai_base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let index_root = std::env::var("INDEX_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let index_max_files = parse_env("INDEX_MAX_FILES", 200usize)?;
        let index_max_file_bytes = parse_env("INDEX_MAX_FILE_BYTES", 64 * 1024u64)?;

        Ok(Self {
            host,
            port,
            engines_path,
            task_store,
            task_state_dir,
            bus_backend,
            bus_dir,
            nack_policy,
            max_concurrent_agents,
            llm_timeout,
            confidence_threshold,
            ollama_url,
            openai_api_key,
            openai_base_url,
            index_root,
            index_max_files,
            index_max_file_bytes,
        })
    }

    /// Create a config with in-memory backends rooted at `data_dir` (useful for testing).
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            engines_path: data_dir.join("engines.json"),
            task_store: TaskStoreType::Memory,
            task_state_dir: data_dir.join("tasks"),
            bus_backend: BusBackend::Memory,
            bus_dir: data_dir.join("bus"),
            nack_policy: NackPolicy::default(),
            max_concurrent_agents: 8,
            llm_timeout: Duration::from_secs(120),
            confidence_threshold: 0.7,
            ollama_url: "http://localhost:11434".to_string(),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            index_root: data_dir.join("workspace"),
            index_max_files: 200,
            index_max_file_bytes: 64 * 1024,
        }
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine table
// ─────────────────────────────────────────────────────────────────────────────

/// Where an engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineSource {
    Local,
    Api,
}

/// One configured LLM backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(skip_deserializing)]
    pub name: String,
    pub source: EngineSource,
    pub model: String,
    /// Excluded from automatic selection even when enabled
    #[serde(default)]
    pub locked: bool,
    /// Enabled flag
    #[serde(default = "default_toggle")]
    pub toggle: bool,
    /// Endpoint override for this engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_toggle() -> bool {
    true
}

impl EngineConfig {
    pub fn new(name: impl Into<String>, source: EngineSource, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source,
            model: model.into(),
            locked: false,
            toggle: true,
            base_url: None,
        }
    }

    pub fn locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    pub fn toggled(mut self, toggle: bool) -> Self {
        self.toggle = toggle;
        self
    }

    /// Eligible for automatic selection.
    pub fn is_available(&self) -> bool {
        self.toggle && !self.locked
    }
}

/// Raw routing rule as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub condition: String,
    pub engine: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerRules {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub default_engine: Option<String>,
}

/// Engine table plus load balancer rules, loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EngineTable {
    /// Engines in file order; the order drives the last-resort fallback.
    #[serde(default, deserialize_with = "deserialize_engines")]
    pub llm_engines: Vec<EngineConfig>,
    #[serde(default)]
    pub load_balancer_rules: LoadBalancerRules,
}

impl EngineTable {
    /// Load the table from `path`. A missing file yields an empty table.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "Engine configuration not found at {}; no engines available",
                    path.display()
                );
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let table = if is_yaml {
            Self::from_yaml(&raw)
        } else {
            Self::from_json(&raw)
        };
        let table = table.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;

        tracing::info!(
            "Loaded {} engines and {} load balancer rules from {}",
            table.llm_engines.len(),
            table.load_balancer_rules.rules.len(),
            path.display()
        );
        Ok(table)
    }

    pub fn from_json(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|e| e.to_string())
    }

    pub fn from_yaml(raw: &str) -> Result<Self, String> {
        serde_yaml::from_str(raw).map_err(|e| e.to_string())
    }

    pub fn engine(&self, name: &str) -> Option<&EngineConfig> {
        self.llm_engines.iter().find(|e| e.name == name)
    }
}

fn deserialize_engines<'de, D>(deserializer: D) -> Result<Vec<EngineConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnginesVisitor;

    impl<'de> Visitor<'de> for EnginesVisitor {
        type Value = Vec<EngineConfig>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of engine name to engine configuration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut engines: Vec<EngineConfig> = Vec::new();
            while let Some((name, mut engine)) = map.next_entry::<String, EngineConfig>()? {
                if engines.iter().any(|e| e.name == name) {
                    return Err(serde::de::Error::custom(format!(
                        "duplicate engine '{}'",
                        name
                    )));
                }
                engine.name = name;
                engines.push(engine);
            }
            Ok(engines)
        }
    }

    deserializer.deserialize_map(EnginesVisitor)
}
