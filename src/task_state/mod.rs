//! Task state storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `file`: one JSON document per task under `active/` and `history/`
//!
//! A task lives in the active area until it is finalized with
//! [`TaskStore::complete`] or [`TaskStore::fail`]; finalization moves it to the
//! history area, which is never modified again.

mod file;
mod memory;
#[cfg(test)]
mod tests_common;

pub use file::FileTaskStore;
pub use memory::InMemoryTaskStore;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Lifecycle status of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    Received,
    Processing,
    Executing,
    Planned,
    Completed,
    Failed,
    /// Agent-specific intermediate status.
    Interim(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Received => "Received",
            TaskStatus::Processing => "Processing",
            TaskStatus::Executing => "Executing",
            TaskStatus::Planned => "Planned",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
            TaskStatus::Interim(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl From<String> for TaskStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Received" => TaskStatus::Received,
            "Processing" => TaskStatus::Processing,
            "Executing" => TaskStatus::Executing,
            "Planned" => TaskStatus::Planned,
            "Completed" => TaskStatus::Completed,
            "Failed" => TaskStatus::Failed,
            _ => TaskStatus::Interim(s),
        }
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a task's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// A tracked task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub prompt: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub created_at: String,
    pub updated_at: String,
    /// Set only when Completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Set only when Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// A fresh task with its creation entry.
    pub fn new(task_id: String, prompt: &str, status: TaskStatus, payload: Map<String, Value>) -> Self {
        let now = now_string();
        Self {
            task_id,
            prompt: prompt.to_string(),
            status,
            payload,
            history: vec![HistoryEntry {
                timestamp: now.clone(),
                event: format!("Task created: {}", prompt),
                payload: None,
            }],
            created_at: now.clone(),
            updated_at: now,
            result: None,
            error: None,
        }
    }

    /// Set status and shallow-merge `payload` (last write wins per key).
    pub fn apply_update(&mut self, status: Option<TaskStatus>, payload: Option<Map<String, Value>>) {
        if let Some(status) = status {
            self.status = status;
        }
        if let Some(payload) = payload {
            for (key, value) in payload {
                self.payload.insert(key, value);
            }
        }
        self.updated_at = now_string();
    }

    pub fn push_history(&mut self, event: &str, payload: Option<Value>) {
        let now = now_string();
        self.history.push(HistoryEntry {
            timestamp: now.clone(),
            event: event.to_string(),
            payload,
        });
        self.updated_at = now;
    }

    /// Record a terminal outcome.
    pub fn finalize(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed(result) => {
                self.push_history(&format!("Task completed with result: {}", result), None);
                self.status = TaskStatus::Completed;
                self.result = Some(result);
            }
            Outcome::Failed(error) => {
                self.push_history(&format!("Task failed: {}", error), None);
                self.status = TaskStatus::Failed;
                self.error = Some(error);
            }
        }
    }
}

/// Terminal outcome passed to [`Task::finalize`].
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(String),
    Failed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task {0} not found")]
    NotFound(String),

    #[error("Task store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task store directory {0} is locked by another process")]
    Locked(PathBuf),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Task store trait - implemented by all storage backends.
///
/// Mutations on one task are serialized; different tasks never wait on each other.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Create a task with a fresh id and one history entry.
    async fn create(
        &self,
        prompt: &str,
        status: TaskStatus,
        payload: Map<String, Value>,
    ) -> Result<String, StoreError>;

    /// Active task by id.
    async fn get(&self, task_id: &str) -> Result<Task, StoreError>;

    /// Finalized task by id.
    async fn get_history(&self, task_id: &str) -> Result<Task, StoreError>;

    /// Set status and/or shallow-merge payload. Adds no history entry.
    async fn update(
        &self,
        task_id: &str,
        status: Option<TaskStatus>,
        payload: Option<Map<String, Value>>,
    ) -> Result<(), StoreError>;

    /// Append exactly one history entry.
    async fn add_history(
        &self,
        task_id: &str,
        event: &str,
        payload: Option<Value>,
    ) -> Result<(), StoreError>;

    /// Finalize as Completed and move to history.
    async fn complete(&self, task_id: &str, result: &str) -> Result<(), StoreError>;

    /// Finalize as Failed and move to history.
    async fn fail(&self, task_id: &str, error: &str) -> Result<(), StoreError>;

    /// Snapshot of in-flight tasks, oldest first.
    async fn list_active(&self) -> Result<Vec<Task>, StoreError>;

    /// Active record, else finalized record.
    async fn lookup(&self, task_id: &str) -> Result<Task, StoreError> {
        match self.get(task_id).await {
            Err(StoreError::NotFound(_)) => self.get_history(task_id).await,
            other => other,
        }
    }
}

/// Task store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStoreType {
    Memory,
    #[default]
    File,
}

impl TaskStoreType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => Self::Memory,
            "file" | "json" => Self::File,
            _ => Self::default(),
        }
    }
}

/// Create a task store based on type and configuration.
pub async fn create_task_store(
    store_type: TaskStoreType,
    base_dir: PathBuf,
) -> Result<Arc<dyn TaskStore>, StoreError> {
    match store_type {
        TaskStoreType::Memory => Ok(Arc::new(InMemoryTaskStore::new())),
        TaskStoreType::File => Ok(Arc::new(FileTaskStore::open(base_dir).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_form() {
        assert_eq!(
            serde_json::to_value(TaskStatus::Planned).expect("serialize"),
            serde_json::json!("Planned")
        );
        let interim: TaskStatus = serde_json::from_str("\"Drafting\"").expect("parse");
        assert_eq!(interim, TaskStatus::Interim("Drafting".to_string()));
        assert_eq!(interim.to_string(), "Drafting");
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!interim.is_terminal());
    }

    #[test]
    fn test_apply_update_is_shallow_merge() {
        let mut payload = Map::new();
        payload.insert("a".to_string(), serde_json::json!({"x": 1}));
        payload.insert("b".to_string(), serde_json::json!(1));
        let mut task = Task::new("id".to_string(), "p", TaskStatus::Received, payload);

        let mut patch = Map::new();
        patch.insert("a".to_string(), serde_json::json!({"y": 2}));
        task.apply_update(Some(TaskStatus::Processing), Some(patch));

        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.payload["a"], serde_json::json!({"y": 2}));
        assert_eq!(task.payload["b"], serde_json::json!(1));
        assert_eq!(task.history.len(), 1);
    }

    #[test]
    fn test_finalize_sets_exactly_one_outcome() {
        let mut task = Task::new("id".to_string(), "p", TaskStatus::Processing, Map::new());
        task.finalize(Outcome::Failed("boom".to_string()));
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(task.result.is_none());
        assert_eq!(
            task.history.last().map(|h| h.event.as_str()),
            Some("Task failed: boom")
        );
    }

    #[test]
    fn test_store_type_parsing() {
        assert_eq!(TaskStoreType::from_str("MEMORY"), TaskStoreType::Memory);
        assert_eq!(TaskStoreType::from_str("json"), TaskStoreType::File);
        assert_eq!(TaskStoreType::from_str("sqlite"), TaskStoreType::File);
    }
}
