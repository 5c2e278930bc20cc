//! In-memory task store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{Outcome, StoreError, Task, TaskStatus, TaskStore};

/// `None` marks a slot whose task was finalized while another caller was waiting on it.
type Slot = Arc<Mutex<Option<Task>>>;

#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    active: Arc<RwLock<HashMap<String, Slot>>>,
    history: Arc<RwLock<HashMap<String, Task>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, task_id: &str) -> Result<Slot, StoreError> {
        self.active
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    /// Run `f` on the active task while holding its lock.
    async fn with_task<T>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut Task) -> T + Send,
    ) -> Result<T, StoreError> {
        let slot = self.slot(task_id).await?;
        let mut guard = slot.lock().await;
        match guard.as_mut() {
            Some(task) => Ok(f(task)),
            None => Err(StoreError::NotFound(task_id.to_string())),
        }
    }

    async fn finalize(&self, task_id: &str, outcome: Outcome) -> Result<(), StoreError> {
        let slot = self.slot(task_id).await?;
        // Held until the active entry is gone so no reader sees the task in both areas
        let mut guard = slot.lock().await;
        let mut task = guard
            .take()
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        task.finalize(outcome);
        tracing::debug!("Task {} finalized as {}", task_id, task.status);

        self.history.write().await.insert(task_id.to_string(), task);
        self.active.write().await.remove(task_id);
        drop(guard);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create(
        &self,
        prompt: &str,
        status: TaskStatus,
        payload: Map<String, Value>,
    ) -> Result<String, StoreError> {
        let task_id = Uuid::new_v4().to_string();
        let task = Task::new(task_id.clone(), prompt, status, payload);
        self.active
            .write()
            .await
            .insert(task_id.clone(), Arc::new(Mutex::new(Some(task))));
        Ok(task_id)
    }

    async fn get(&self, task_id: &str) -> Result<Task, StoreError> {
        self.with_task(task_id, |task| task.clone()).await
    }

    async fn get_history(&self, task_id: &str) -> Result<Task, StoreError> {
        self.history
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    async fn update(
        &self,
        task_id: &str,
        status: Option<TaskStatus>,
        payload: Option<Map<String, Value>>,
    ) -> Result<(), StoreError> {
        self.with_task(task_id, move |task| task.apply_update(status, payload))
            .await
    }

    async fn add_history(
        &self,
        task_id: &str,
        event: &str,
        payload: Option<Value>,
    ) -> Result<(), StoreError> {
        self.with_task(task_id, move |task| task.push_history(event, payload))
            .await
    }

    async fn complete(&self, task_id: &str, result: &str) -> Result<(), StoreError> {
        self.finalize(task_id, Outcome::Completed(result.to_string()))
            .await
    }

    async fn fail(&self, task_id: &str, error: &str) -> Result<(), StoreError> {
        self.finalize(task_id, Outcome::Failed(error.to_string()))
            .await
    }

    async fn list_active(&self) -> Result<Vec<Task>, StoreError> {
        let slots: Vec<Slot> = self.active.read().await.values().cloned().collect();
        let mut tasks = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(task) = slot.lock().await.as_ref() {
                tasks.push(task.clone());
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }
}
