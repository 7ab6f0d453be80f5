//! Tests for SqliteTaskStore.

mod common;

use chrono::{Duration, Utc};
use common::setup_store;
use offqueue::{NewTask, RunFilter, TaskId, TaskStore};

#[tokio::test]
async fn test_insert_and_get() {
    let store = setup_store().await;

    let task = NewTask::new("Sync").with_data_id("42");
    let stored = store.insert(&task, Utc::now()).await.unwrap();

    let fetched = store.get(stored.id).await.unwrap().unwrap();
    assert_eq!(fetched, stored);
    assert_eq!(fetched.tag, "Sync");
    assert_eq!(fetched.data_id.as_deref(), Some("42"));
    assert!(fetched.group_id.is_none());
    assert!(!fetched.manually_run);

    assert!(store.get(TaskId(9999)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_find_by_identity_matches_missing_data_id() {
    let store = setup_store().await;

    store.insert(&NewTask::new("Sync"), Utc::now()).await.unwrap();
    store
        .insert(&NewTask::new("Sync").with_data_id("1"), Utc::now())
        .await
        .unwrap();

    let without = store.find_by_identity("Sync", None).await.unwrap();
    assert_eq!(without.len(), 1);
    assert!(without[0].data_id.is_none());

    let with = store.find_by_identity("Sync", Some("1")).await.unwrap();
    assert_eq!(with.len(), 1);

    assert!(store.find_by_identity("Upload", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ungrouped_identity_is_unique() {
    let store = setup_store().await;

    let task = NewTask::new("Sync").with_data_id("42");
    store.insert(&task, Utc::now()).await.unwrap();

    assert!(store.insert(&task, Utc::now()).await.is_err());
}

#[tokio::test]
async fn test_grouped_identity_may_repeat() {
    let store = setup_store().await;

    let task = NewTask::new("Album").with_data_id("a").with_group_id("g");
    let first = store.insert(&task, Utc::now()).await.unwrap();
    let second = store.insert(&task, Utc::now()).await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(store.find_by_identity("Album", Some("a")).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_replace_by_identity_assigns_new_id() {
    let store = setup_store().await;

    let original = store
        .insert(&NewTask::new("Sync").with_data_id("42"), Utc::now())
        .await
        .unwrap();
    store
        .upsert_error(original.id, Some("boom"), None, Utc::now())
        .await
        .unwrap();

    let replacement = NewTask::new("Sync").with_data_id("42").manually_run(true);
    let replaced = store.replace_by_identity(&replacement, Utc::now()).await.unwrap();

    assert!(replaced.id > original.id);
    assert!(replaced.manually_run);
    assert!(store.get(original.id).await.unwrap().is_none());
    assert!(store.error_for(original.id).await.unwrap().is_none());
    assert_eq!(store.all_tasks().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_group_head_and_tail() {
    let store = setup_store().await;
    let now = Utc::now();

    let a = store
        .insert(&NewTask::new("Album").with_data_id("a").with_group_id("g"), now)
        .await
        .unwrap();
    store
        .insert(&NewTask::new("Album").with_data_id("b").with_group_id("g"), now + Duration::seconds(1))
        .await
        .unwrap();
    let c = store
        .insert(&NewTask::new("Album").with_data_id("c").with_group_id("g"), now + Duration::seconds(2))
        .await
        .unwrap();

    assert_eq!(store.group_head("g").await.unwrap().unwrap().id, a.id);
    assert_eq!(store.group_tail("g").await.unwrap().unwrap().id, c.id);
    assert!(store.group_head("other").await.unwrap().is_none());

    store.delete(a.id).await.unwrap();
    let head = store.group_head("g").await.unwrap().unwrap();
    assert_eq!(head.data_id.as_deref(), Some("b"));
}

#[tokio::test]
async fn test_next_eligible_orders_by_created_at() {
    let store = setup_store().await;
    let now = Utc::now();

    store
        .insert(&NewTask::new("Sync").with_data_id("late"), now + Duration::seconds(5))
        .await
        .unwrap();
    let early = store
        .insert(&NewTask::new("Sync").with_data_id("early"), now)
        .await
        .unwrap();

    let first = store
        .next_eligible(TaskId(0), &[], &RunFilter::all())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, early.id);

    let all: Vec<_> = store
        .all_tasks()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.data_id.unwrap())
        .collect();
    assert_eq!(all, vec!["early", "late"]);
}

#[tokio::test]
async fn test_next_eligible_skips_manual_and_excluded_groups() {
    let store = setup_store().await;
    let now = Utc::now();

    store
        .insert(&NewTask::new("Sync").with_data_id("manual").manually_run(true), now)
        .await
        .unwrap();
    store
        .insert(&NewTask::new("Album").with_data_id("a").with_group_id("g"), now + Duration::seconds(1))
        .await
        .unwrap();
    let plain = store
        .insert(&NewTask::new("Sync").with_data_id("plain"), now + Duration::seconds(2))
        .await
        .unwrap();

    let excluded = vec!["g".to_string()];
    let next = store
        .next_eligible(TaskId(0), &excluded, &RunFilter::all())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.id, plain.id);

    let in_group = store
        .next_eligible(TaskId(0), &[], &RunFilter::group("g"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(in_group.data_id.as_deref(), Some("a"));

    assert!(store
        .next_eligible(plain.id, &excluded, &RunFilter::all())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_count_eligible() {
    let store = setup_store().await;

    store.insert(&NewTask::new("Sync").with_data_id("1"), Utc::now()).await.unwrap();
    store
        .insert(&NewTask::new("Sync").with_data_id("2").manually_run(true), Utc::now())
        .await
        .unwrap();
    store
        .insert(&NewTask::new("Album").with_data_id("a").with_group_id("g"), Utc::now())
        .await
        .unwrap();

    assert_eq!(store.count_eligible(&RunFilter::all()).await.unwrap(), 2);
    assert_eq!(store.count_eligible(&RunFilter::group("g")).await.unwrap(), 1);
    assert_eq!(store.count_eligible(&RunFilter::group("none")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_runnable_in_group_excludes_manual() {
    let store = setup_store().await;

    store
        .insert(&NewTask::new("Album").with_data_id("a").with_group_id("g"), Utc::now())
        .await
        .unwrap();
    store
        .insert(
            &NewTask::new("Album").with_data_id("b").with_group_id("g").manually_run(true),
            Utc::now(),
        )
        .await
        .unwrap();

    let runnable = store.runnable_in_group("g").await.unwrap();
    assert_eq!(runnable.len(), 1);
    assert_eq!(runnable[0].data_id.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_error_upsert_replaces() {
    let store = setup_store().await;
    let task = store.insert(&NewTask::new("Sync"), Utc::now()).await.unwrap();

    store.upsert_error(task.id, Some("first"), Some("E1"), Utc::now()).await.unwrap();
    let second = store
        .upsert_error(task.id, Some("second"), None, Utc::now())
        .await
        .unwrap();

    assert_eq!(second.message.as_deref(), Some("second"));
    assert!(second.error_id.is_none());
    assert_eq!(store.all_errors().await.unwrap().len(), 1);
    assert_eq!(store.error_for(task.id).await.unwrap(), Some(second));

    assert!(store.delete_error(task.id).await.unwrap());
    assert!(!store.delete_error(task.id).await.unwrap());
    assert!(store.error_for(task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_removes_error() {
    let store = setup_store().await;
    let task = store.insert(&NewTask::new("Sync"), Utc::now()).await.unwrap();
    store.upsert_error(task.id, None, None, Utc::now()).await.unwrap();

    assert!(store.delete(task.id).await.unwrap());
    assert!(!store.delete(task.id).await.unwrap());
    assert!(store.all_errors().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rerun_flag() {
    let store = setup_store().await;

    assert!(!store.rerun_flag().await.unwrap());
    store.set_rerun_flag(true).await.unwrap();
    assert!(store.rerun_flag().await.unwrap());
    store.set_rerun_flag(false).await.unwrap();
    assert!(!store.rerun_flag().await.unwrap());
}

#[tokio::test]
async fn test_clear_all_never_reuses_ids() {
    let store = setup_store().await;

    let before = store.insert(&NewTask::new("Sync"), Utc::now()).await.unwrap();
    store.upsert_error(before.id, None, None, Utc::now()).await.unwrap();
    store.set_rerun_flag(true).await.unwrap();

    store.clear_all().await.unwrap();

    assert!(store.all_tasks().await.unwrap().is_empty());
    assert!(store.all_errors().await.unwrap().is_empty());
    assert!(!store.rerun_flag().await.unwrap());
    assert_eq!(store.count_eligible(&RunFilter::all()).await.unwrap(), 0);

    let after = store.insert(&NewTask::new("Sync"), Utc::now()).await.unwrap();
    assert!(after.id > before.id);
}
