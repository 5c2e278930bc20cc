//! Messages exchanged on the task queues.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn received() -> String {
    "Received".to_string()
}

/// Body of a `tasks.inbound` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundTask {
    pub task_id: String,
    pub prompt: String,
    #[serde(default = "received")]
    pub status: String,
    /// Epoch seconds at submission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Skips classification of the mode when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl InboundTask {
    pub fn new(task_id: &str, prompt: &str, start_time: f64) -> Self {
        Self {
            task_id: task_id.to_string(),
            prompt: prompt.to_string(),
            status: received(),
            start_time: Some(start_time),
            profile: None,
            role: None,
            mode: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackStatus {
    Completed,
    Failed,
}

/// Body of a `tasks.feedback` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackMessage {
    pub task_id: String,
    pub status: FeedbackStatus,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FeedbackMessage {
    pub fn completed(task_id: &str, payload: Map<String, Value>) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: FeedbackStatus::Completed,
            payload,
            error: None,
        }
    }

    pub fn failed(task_id: &str, error: String) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: FeedbackStatus::Failed,
            payload: Map::new(),
            error: Some(error),
        }
    }

    /// `payload.result` as text; non-string results are rendered as JSON.
    pub fn result_text(&self) -> String {
        match self.payload.get("result") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}
