//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, EngineSource};
use crate::llm::EngineStatus;

/// Request to submit a new task.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    /// The user prompt
    pub prompt: String,

    /// Optional profile hint, recorded with the task
    #[serde(default)]
    pub profile: Option<String>,

    /// Optional role; honoured when the request is classified as Agent
    #[serde(default)]
    pub role: Option<String>,
}

/// Response after queueing a task.
#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: String,

    /// Always "Queued": processing happens asynchronously
    pub status: &'static str,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Message bus lifecycle state
    pub bus: String,
    /// Whether tasks survive a restart
    pub persistent_store: bool,
    pub engines: usize,
    pub agents: usize,
}

/// One row of `GET /engines`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineView {
    pub name: String,
    pub source: EngineSource,
    pub model: String,
    pub locked: bool,
    pub toggle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Eligible for selection (toggled on and not locked)
    pub available: bool,
    pub status: EngineStatus,
}

impl EngineView {
    pub fn new(config: &EngineConfig, status: EngineStatus) -> Self {
        Self {
            name: config.name.clone(),
            source: config.source,
            model: config.model.clone(),
            locked: config.locked,
            toggle: config.toggle,
            base_url: config.base_url.clone(),
            available: config.is_available(),
            status,
        }
    }
}

/// Response of `GET /engines`.
#[derive(Debug, Clone, Serialize)]
pub struct EnginesResponse {
    pub engines: Vec<EngineView>,
    pub default_engine: Option<String>,
    /// Rule conditions in evaluation order, as `condition -> engine`
    pub rules: Vec<String>,
}
