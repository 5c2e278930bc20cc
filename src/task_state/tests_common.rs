//! Behaviour every task store backend must show.

use std::sync::Arc;

use serde_json::{json, Map};

use super::{StoreError, TaskStatus, TaskStore};

pub async fn create_then_get(store: &dyn TaskStore) {
    let mut payload = Map::new();
    payload.insert("start_time".to_string(), json!(1_700_000_000.5));
    let id = store
        .create("Write a haiku", TaskStatus::Received, payload)
        .await
        .expect("create");

    let task = store.get(&id).await.expect("get");
    assert_eq!(task.task_id, id);
    assert_eq!(task.status, TaskStatus::Received);
    assert_eq!(task.history.len(), 1);
    assert_eq!(task.history[0].event, "Task created: Write a haiku");
    assert_eq!(task.payload["start_time"], json!(1_700_000_000.5));
    assert!(task.result.is_none() && task.error.is_none());

    assert!(matches!(
        store.get_history(&id).await,
        Err(StoreError::NotFound(_))
    ));
}

pub async fn double_complete_is_not_found(store: &dyn TaskStore) {
    let id = store
        .create("p", TaskStatus::Processing, Map::new())
        .await
        .expect("create");
    store.complete(&id, "first").await.expect("complete");
    let finalized = store.get_history(&id).await.expect("history");

    assert!(store.complete(&id, "second").await.expect_err("twice").is_not_found());
    assert!(store.fail(&id, "late").await.expect_err("after").is_not_found());
    assert!(store.get(&id).await.expect_err("inactive").is_not_found());

    let again = store.get_history(&id).await.expect("history");
    assert_eq!(again, finalized);
    assert_eq!(again.status, TaskStatus::Completed);
    assert_eq!(again.result.as_deref(), Some("first"));
    assert!(again.error.is_none());
    assert_eq!(
        again.history.last().map(|h| h.event.as_str()),
        Some("Task completed with result: first")
    );
}

pub async fn concurrent_add_history<S: TaskStore + 'static>(store: Arc<S>) {
    let id = store
        .create("p", TaskStatus::Processing, Map::new())
        .await
        .expect("create");

    let mut handles = Vec::new();
    for i in 0..32 {
        let store = Arc::clone(&store);
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            store
                .add_history(&id, &format!("event {}", i), Some(json!({ "i": i })))
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("add_history");
    }

    let task = store.get(&id).await.expect("get");
    assert_eq!(task.history.len(), 33);
    for i in 0..32 {
        let event = format!("event {}", i);
        assert_eq!(task.history.iter().filter(|h| h.event == event).count(), 1);
    }
}

pub async fn update_and_lookup(store: &dyn TaskStore) {
    let id = store
        .create("p", TaskStatus::Received, Map::new())
        .await
        .expect("create");

    let mut patch = Map::new();
    patch.insert("analysis".to_string(), json!({"mode": "Agent"}));
    store
        .update(&id, Some(TaskStatus::Executing), Some(patch))
        .await
        .expect("update");
    store.update(&id, None, None).await.expect("no-op update");

    let task = store.lookup(&id).await.expect("active");
    assert_eq!(task.status, TaskStatus::Executing);
    assert_eq!(task.payload["analysis"]["mode"], "Agent");
    assert_eq!(task.history.len(), 1);

    assert_eq!(store.list_active().await.expect("list").len(), 1);

    store.fail(&id, "backend down").await.expect("fail");
    let task = store.lookup(&id).await.expect("finalized");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("backend down"));
    assert!(store.list_active().await.expect("list").is_empty());

    assert!(store.lookup("missing").await.expect_err("unknown").is_not_found());
    assert!(store
        .update("missing", Some(TaskStatus::Planned), None)
        .await
        .expect_err("unknown")
        .is_not_found());
}

/// While a task is being finalized, `lookup` always finds it in one area or the other.
pub async fn never_visible_in_both_areas<S: TaskStore + 'static>(store: Arc<S>) {
    for _ in 0..20 {
        let id = store
            .create("p", TaskStatus::Processing, Map::new())
            .await
            .expect("create");

        let reader = {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let task = store.lookup(&id).await.expect("always found");
                    if task.status.is_terminal() {
                        assert!(store.get(&id).await.is_err());
                        return;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        store.complete(&id, "done").await.expect("complete");
        reader.await.expect("reader");
        assert!(store.get(&id).await.is_err());
        assert!(store.get_history(&id).await.is_ok());
    }
}
