//! Agents module - role name to executable unit.
//!
//! # Agent Kinds
//! - **LocalAgent**: answers directly, no LLM involved (Chat-Agent,
//!   Vision-Agent, File-Indexing-Agent)
//! - **PromptAgent**: turns a request into a backend prompt; the dispatcher
//!   runs the prompt on the engine the load balancer picks
//!
//! The [`PlannerAgent`] is not role-addressed: Plan mode uses it directly.

mod chat;
mod indexing;
mod planner;
mod templates;
mod vision;

pub use chat::ChatAgent;
pub use indexing::{FileIndexingAgent, IndexSettings};
pub use planner::{PlanStep, PlannerAgent, DEFAULT_DESIGN_HINT};
pub use templates::{PromptTemplate, PromptTemplateAgent, PROMPT_TEMPLATES};
pub use vision::VisionAgent;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AgentError {
    #[error("{role} received an empty request")]
    EmptyRequest { role: String },

    #[error("No agent registered for role(s): {}", .0.join(", "))]
    MissingRoles(Vec<String>),

    #[error("Path '{0}' is outside the index root")]
    OutsideRoot(String),

    #[error("Indexing failed: {0}")]
    Index(String),
}

/// Common identity of every agent.
pub trait Agent: Send + Sync {
    /// Role name, e.g. `Writing-Agent`
    fn role(&self) -> &str;

    /// Profile the role belongs to, e.g. `Productivity`
    fn profile(&self) -> &str;

    fn description(&self) -> &str;
}

/// Agent that produces its answer itself.
pub trait LocalAgent: Agent {
    fn respond(&self, request: &str) -> Result<String, AgentError>;
}

/// Agent that needs an LLM: builds the prompt, the dispatcher runs it.
pub trait PromptAgent: Agent {
    fn build_prompt(&self, request: &str) -> Result<String, AgentError>;
}

#[derive(Clone)]
pub enum RegisteredAgent {
    Local(Arc<dyn LocalAgent>),
    Generative(Arc<dyn PromptAgent>),
}

impl RegisteredAgent {
    pub fn role(&self) -> &str {
        match self {
            RegisteredAgent::Local(agent) => agent.role(),
            RegisteredAgent::Generative(agent) => agent.role(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, RegisteredAgent::Local(_))
    }

    pub fn info(&self) -> AgentInfo {
        let (profile, description, kind) = match self {
            RegisteredAgent::Local(agent) => (agent.profile(), agent.description(), "local"),
            RegisteredAgent::Generative(agent) => (agent.profile(), agent.description(), "llm"),
        };
        AgentInfo {
            role: self.role().to_string(),
            profile: profile.to_string(),
            description: description.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub role: String,
    pub profile: String,
    pub description: String,
    pub kind: &'static str,
}

/// String-keyed agent lookup, built once at startup.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, RegisteredAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the full built-in catalog, indexing the current directory.
    pub fn with_defaults() -> Self {
        Self::with_index(IndexSettings::default())
    }

    /// Registry with the full built-in catalog.
    pub fn with_index(index: IndexSettings) -> Self {
        let mut registry = Self::new();
        registry.register(RegisteredAgent::Local(Arc::new(ChatAgent::new())));
        registry.register(RegisteredAgent::Local(Arc::new(VisionAgent::new())));
        registry.register(RegisteredAgent::Local(Arc::new(FileIndexingAgent::new(index))));
        for template in PROMPT_TEMPLATES {
            registry.register(RegisteredAgent::Generative(Arc::new(
                PromptTemplateAgent::new(template),
            )));
        }
        registry
    }

    pub fn register(&mut self, agent: RegisteredAgent) {
        let role = agent.role().to_string();
        if self.agents.insert(role.clone(), agent).is_some() {
            tracing::warn!("Agent role '{}' registered twice; keeping the latest", role);
        }
    }

    pub fn get(&self, role: &str) -> Option<&RegisteredAgent> {
        self.agents.get(role)
    }

    /// Registered roles, sorted.
    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.agents.keys().cloned().collect();
        roles.sort();
        roles
    }

    pub fn list(&self) -> Vec<AgentInfo> {
        let mut list: Vec<AgentInfo> = self.agents.values().map(RegisteredAgent::info).collect();
        list.sort_by(|a, b| a.role.cmp(&b.role));
        list
    }

    /// Fail if any of `required` has no registered agent.
    pub fn validate(&self, required: &[&str]) -> Result<(), AgentError> {
        let missing: Vec<String> = required
            .iter()
            .filter(|role| !self.agents.contains_key(**role))
            .map(|role| role.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AgentError::MissingRoles(missing))
        }
    }
}

/// Reject blank requests for `role`.
fn require_request<'a>(role: &str, request: &'a str) -> Result<&'a str, AgentError> {
    let trimmed = request.trim();
    if trimmed.is_empty() {
        Err(AgentError::EmptyRequest {
            role: role.to_string(),
        })
    } else {
        Ok(trimmed)
    }
}
