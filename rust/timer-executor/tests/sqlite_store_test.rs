// SQLite store behavior on a temporary database file
use std::collections::HashMap;

use serde_json::json;
use tempfile::TempDir;

use timer_executor::key::TaskKey;
use timer_executor::model::{NotifyParam, TaskStatus, TimerDefinition, TimerStatus};
use timer_executor::store::{SqliteStore, TaskStore, TimerStore};
use timer_executor::ExecutorError;

async fn open() -> (TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("timers.db")).await.unwrap();
    (dir, store)
}

fn timer() -> TimerDefinition {
    TimerDefinition {
        id: 42,
        name: "settle-invoice".to_string(),
        app: "billing".to_string(),
        status: TimerStatus::Enabled,
        notify_http_param: NotifyParam {
            method: "post".to_string(),
            url: "https://x/cb".to_string(),
            header: HashMap::from([("X-Token".to_string(), "secret".to_string())]),
            body: Some(json!({"a": 1})),
        },
    }
}

#[tokio::test]
async fn test_timer_round_trip() {
    let (_dir, store) = open().await;
    store.insert_timer(&timer()).await.unwrap();

    assert_eq!(store.get_timer(42).await.unwrap(), timer());
}

#[tokio::test]
async fn test_missing_timer() {
    let (_dir, store) = open().await;
    let err = store.get_timer(7).await.unwrap_err();
    assert!(matches!(err, ExecutorError::TimerNotFound { timer_id: 7 }));
}

#[tokio::test]
async fn test_task_lifecycle() {
    let (_dir, store) = open().await;
    let key = TaskKey::new(42, 1_700_000_000_000);

    assert!(store.get_task(key).await.unwrap().is_none());
    assert!(store.insert_task(key, "billing").await.unwrap());
    assert!(!store.insert_task(key, "billing").await.unwrap());

    let mut record = store.get_task(key).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::NotRun);
    assert_eq!(record.output, "");

    record.status = TaskStatus::Success;
    record.output = r#"{"ok":true}"#.to_string();
    record.cost_time = 37;
    store.update_task(&record).await.unwrap();

    assert_eq!(store.get_task(key).await.unwrap().unwrap(), record);
}

#[tokio::test]
async fn test_update_requires_existing_record() {
    let (_dir, store) = open().await;
    let key = TaskKey::new(42, 1_700_000_000_000);
    store.insert_task(key, "billing").await.unwrap();

    let mut orphan = store.get_task(key).await.unwrap().unwrap();
    orphan.run_timer += 1;
    orphan.status = TaskStatus::Failed;

    let err = store.update_task(&orphan).await.unwrap_err();
    assert!(matches!(err, ExecutorError::RecordNotFound { timer_id: 42, .. }));
}

#[tokio::test]
async fn test_update_never_resets_to_not_run() {
    let (_dir, store) = open().await;
    let key = TaskKey::new(42, 1_700_000_000_000);
    store.insert_task(key, "billing").await.unwrap();

    let record = store.get_task(key).await.unwrap().unwrap();
    let err = store.update_task(&record).await.unwrap_err();
    assert!(matches!(err, ExecutorError::Storage(_)));
}

#[tokio::test]
async fn test_schema_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("timers.db");

    let store = SqliteStore::new(&path).await.unwrap();
    store.insert_timer(&timer()).await.unwrap();
    drop(store);

    let reopened = SqliteStore::new(&path).await.unwrap();
    assert_eq!(reopened.get_timer(42).await.unwrap().app, "billing");
}

#[tokio::test]
async fn test_open_failure_names_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("timers.db");

    let err = SqliteStore::new(&path).await.unwrap_err();
    match err {
        ExecutorError::Storage(message) => {
            assert!(message.contains("Failed to open task database"), "{message}");
            assert!(message.contains("missing"), "{message}");
        }
        other => panic!("expected a storage error, got {other:?}"),
    }
}
