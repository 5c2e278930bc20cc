//! JSON file-based task store.
//!
//! Layout under the base directory:
//!
//! ```text
//! .lock               exclusive OS lock, held for the store's lifetime
//! active/<id>.json    in-flight tasks
//! history/<id>.json   finalized tasks
//! ```
//!
//! Every write goes to `<file>.tmp` first and is renamed into place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Outcome, StoreError, Task, TaskStatus, TaskStore};

const ACTIVE_DIR: &str = "active";
const HISTORY_DIR: &str = "history";
const LOCK_FILE: &str = ".lock";
/// Idle lock entries are pruned once the table grows past this.
const LOCK_TABLE_PRUNE_AT: usize = 1024;

#[derive(Clone)]
pub struct FileTaskStore {
    root: PathBuf,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    _dir_lock: Arc<std::fs::File>,
}

impl FileTaskStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Fails with `StoreError::Locked` if another process holds the directory.
    pub async fn open(root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(root.join(ACTIVE_DIR)).await?;
        fs::create_dir_all(root.join(HISTORY_DIR)).await?;

        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked(root.clone()))?;

        let store = Self {
            root,
            locks: Arc::new(Mutex::new(HashMap::new())),
            _dir_lock: Arc::new(lock_file),
        };
        store.reconcile().await?;
        tracing::info!("File task store opened at {}", store.root.display());
        Ok(store)
    }

    /// Clean up after a crash: drop temp files, and resolve tasks present in
    /// both areas in favour of the finalized copy.
    async fn reconcile(&self) -> Result<(), StoreError> {
        for area in [ACTIVE_DIR, HISTORY_DIR] {
            let mut entries = fs::read_dir(self.root.join(area)).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                    tracing::warn!("Removing leftover temp file {}", path.display());
                    fs::remove_file(&path).await?;
                }
            }
        }

        let mut entries = fs::read_dir(self.root.join(ACTIVE_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(task_id) = task_id_of(&path) else {
                continue;
            };
            if fs::try_exists(self.history_path(&task_id)).await? {
                tracing::warn!(
                    "Task {} found in both active and history areas; keeping history",
                    task_id
                );
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    fn active_path(&self, task_id: &str) -> PathBuf {
        self.root.join(ACTIVE_DIR).join(format!("{}.json", task_id))
    }

    fn history_path(&self, task_id: &str) -> PathBuf {
        self.root.join(HISTORY_DIR).join(format!("{}.json", task_id))
    }

    /// Exclusive lock for one task id.
    async fn lock(&self, task_id: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().await;
            if locks.len() > LOCK_TABLE_PRUNE_AT {
                // Only the table holds an idle entry
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(task_id.to_string()).or_default())
        };
        entry.lock_owned().await
    }

    async fn read_task(path: &Path, task_id: &str) -> Result<Task, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(task_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write_task(path: &Path, task: &Task) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(task)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    /// Load, mutate and write back an active task under its lock.
    async fn modify(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut Task) + Send,
    ) -> Result<(), StoreError> {
        check_id(task_id)?;
        let _guard = self.lock(task_id).await;
        let path = self.active_path(task_id);
        let mut task = Self::read_task(&path, task_id).await?;
        f(&mut task);
        Self::write_task(&path, &task).await
    }

    async fn finalize(&self, task_id: &str, outcome: Outcome) -> Result<(), StoreError> {
        check_id(task_id)?;
        let _guard = self.lock(task_id).await;
        let active = self.active_path(task_id);
        let mut task = Self::read_task(&active, task_id).await?;
        task.finalize(outcome);

        // History first: a crash in between leaves both copies, which open() resolves
        Self::write_task(&self.history_path(task_id), &task).await?;
        fs::remove_file(&active).await?;
        tracing::debug!("Task {} finalized as {}", task_id, task.status);
        Ok(())
    }
}

/// Ids are UUIDs; anything else cannot name a stored task.
fn check_id(task_id: &str) -> Result<(), StoreError> {
    Uuid::parse_str(task_id)
        .map(|_| ())
        .map_err(|_| StoreError::NotFound(task_id.to_string()))
}

fn task_id_of(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    Uuid::parse_str(stem).ok().map(|_| stem.to_string())
}

#[async_trait]
impl TaskStore for FileTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create(
        &self,
        prompt: &str,
        status: TaskStatus,
        payload: Map<String, Value>,
    ) -> Result<String, StoreError> {
        let task_id = Uuid::new_v4().to_string();
        let task = Task::new(task_id.clone(), prompt, status, payload);
        let _guard = self.lock(&task_id).await;
        Self::write_task(&self.active_path(&task_id), &task).await?;
        Ok(task_id)
    }

    async fn get(&self, task_id: &str) -> Result<Task, StoreError> {
        check_id(task_id)?;
        let _guard = self.lock(task_id).await;
        Self::read_task(&self.active_path(task_id), task_id).await
    }

    async fn get_history(&self, task_id: &str) -> Result<Task, StoreError> {
        check_id(task_id)?;
        Self::read_task(&self.history_path(task_id), task_id).await
    }

    async fn update(
        &self,
        task_id: &str,
        status: Option<TaskStatus>,
        payload: Option<Map<String, Value>>,
    ) -> Result<(), StoreError> {
        self.modify(task_id, move |task| task.apply_update(status, payload))
            .await
    }

    async fn add_history(
        &self,
        task_id: &str,
        event: &str,
        payload: Option<Value>,
    ) -> Result<(), StoreError> {
        self.modify(task_id, move |task| task.push_history(event, payload))
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
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(self.root.join(ACTIVE_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(task_id) = task_id_of(&entry.path()) {
                ids.push(task_id);
            }
        }

        let mut tasks = Vec::with_capacity(ids.len());
        for task_id in ids {
            match self.get(&task_id).await {
                Ok(task) => tasks.push(task),
                // Finalized since the directory was listed
                Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_state::tests_common;

    async fn open(dir: &tempfile::TempDir) -> FileTaskStore {
        FileTaskStore::open(dir.path().to_path_buf())
            .await
            .expect("open store")
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let dir = tempfile::tempdir().expect("tempdir");
        tests_common::create_then_get(&open(&dir).await).await;
    }

    #[tokio::test]
    async fn test_double_complete_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        tests_common::double_complete_is_not_found(&open(&dir).await).await;
    }

    #[tokio::test]
    async fn test_concurrent_add_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        tests_common::concurrent_add_history(Arc::new(open(&dir).await)).await;
    }

    #[tokio::test]
    async fn test_update_and_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        tests_common::update_and_lookup(&open(&dir).await).await;
    }

    #[tokio::test]
    async fn test_never_visible_in_both_areas() {
        let dir = tempfile::tempdir().expect("tempdir");
        tests_common::never_visible_in_both_areas(Arc::new(open(&dir).await)).await;
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (active_id, done_id) = {
            let store = open(&dir).await;
            let active_id = store
                .create("still running", TaskStatus::Executing, Map::new())
                .await
                .expect("create");
            let done_id = store
                .create("finished", TaskStatus::Processing, Map::new())
                .await
                .expect("create");
            store.complete(&done_id, "ok").await.expect("complete");
            (active_id, done_id)
        };

        let store = open(&dir).await;
        assert!(store.is_persistent());
        assert_eq!(
            store.get(&active_id).await.expect("active").status,
            TaskStatus::Executing
        );
        assert_eq!(
            store.get_history(&done_id).await.expect("history").result.as_deref(),
            Some("ok")
        );
    }

    #[tokio::test]
    async fn test_second_open_is_locked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _store = open(&dir).await;
        assert!(matches!(
            FileTaskStore::open(dir.path().to_path_buf()).await,
            Err(StoreError::Locked(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_prefers_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id = {
            let store = open(&dir).await;
            let id = store
                .create("p", TaskStatus::Processing, Map::new())
                .await
                .expect("create");
            let stale = store.get(&id).await.expect("get");
            store.fail(&id, "crashed").await.expect("fail");
            // Simulate a crash between the history write and the active delete
            FileTaskStore::write_task(&store.active_path(&id), &stale)
                .await
                .expect("write");
            std::fs::write(dir.path().join(ACTIVE_DIR).join("x.json.tmp"), b"{")
                .expect("write tmp");
            id
        };

        let store = open(&dir).await;
        assert!(store.get(&id).await.expect_err("gone").is_not_found());
        assert_eq!(
            store.get_history(&id).await.expect("history").status,
            TaskStatus::Failed
        );
        assert!(!dir.path().join(ACTIVE_DIR).join("x.json.tmp").exists());
        assert!(store.list_active().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_non_uuid_ids_are_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open(&dir).await;
        assert!(store.get("../../etc/passwd").await.expect_err("bad").is_not_found());
        assert!(store.complete("nope", "x").await.expect_err("bad").is_not_found());
    }
}
