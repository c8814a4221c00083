// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end matching flows: append, long-poll, ack, lease rolls, expiry.

use std::sync::Arc;
use std::time::Duration;

use tempo_core::client::AddTaskRequest;
use tempo_core::persistence::{MemoryStore, TaskStore};
use tempo_core::types::{TaskListId, TaskListType, WorkflowExecution};
use tempo_matching::{MatchingConfig, MatchingEngine};

fn execution(workflow_id: &str) -> WorkflowExecution {
    WorkflowExecution {
        workflow_id: workflow_id.to_string(),
        run_id: uuid::Uuid::new_v4().to_string(),
    }
}

fn add_request(task_list: &str, schedule_id: i64) -> AddTaskRequest {
    AddTaskRequest {
        domain_id: "test-domain".to_string(),
        execution: execution("w1"),
        task_list: task_list.to_string(),
        schedule_id,
        schedule_to_start_timeout_seconds: 0,
    }
}

/// Appends that race a range roll fail with a retryable conditional error;
/// callers retry with the refreshed lease.
async fn add_task_retrying(
    engine: &MatchingEngine,
    task_type: TaskListType,
    request: AddTaskRequest,
) -> i64 {
    for _ in 0..5 {
        match engine.add_task(task_type, request.clone()).await {
            Ok(task_id) => return task_id,
            Err(e) if e.is_condition_failed() => continue,
            Err(e) => panic!("unexpected add_task error: {e}"),
        }
    }
    panic!("add_task did not succeed within retry budget");
}

#[tokio::test]
async fn test_add_poll_complete_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let engine = MatchingEngine::new(store.clone(), MatchingConfig::default());
    let id = TaskListId::new("test-domain", "round-trip", TaskListType::Activity);

    let mut added = Vec::new();
    for schedule_id in [2, 4, 6] {
        added.push(
            engine
                .add_task(TaskListType::Activity, add_request("round-trip", schedule_id))
                .await
                .unwrap(),
        );
    }

    // Tasks come back in task id order and carry their schedule ids.
    let mut delivered = Vec::new();
    for _ in 0..3 {
        let polled = engine
            .poll_task(&id, Duration::from_secs(5))
            .await
            .unwrap()
            .expect("expected a task");
        delivered.push(polled.task.task_id);
        engine.complete_task(&id, polled.task.task_id).await.unwrap();
    }
    assert_eq!(delivered, added);

    // Completion emptied the durable queue.
    let remaining = store.get_tasks(&id, 0, i64::MAX, 100).await.unwrap();
    assert!(remaining.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_poll_empty_list_times_out() {
    let store = Arc::new(MemoryStore::new());
    let engine = MatchingEngine::new(store, MatchingConfig::default());
    let id = TaskListId::new("test-domain", "idle", TaskListType::Decision);

    let polled = engine
        .poll_task(&id, Duration::from_millis(200))
        .await
        .unwrap();
    assert!(polled.is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_ack_level_survives_manager_restart() {
    let store = Arc::new(MemoryStore::new());
    let id = TaskListId::new("test-domain", "ack-persist", TaskListType::Activity);

    let engine = MatchingEngine::new(store.clone(), MatchingConfig::default());
    let mut last_id = 0;
    for schedule_id in [2, 4] {
        engine
            .add_task(TaskListType::Activity, add_request("ack-persist", schedule_id))
            .await
            .unwrap();
    }
    for _ in 0..2 {
        let polled = engine
            .poll_task(&id, Duration::from_secs(5))
            .await
            .unwrap()
            .expect("expected a task");
        last_id = polled.task.task_id;
        engine.complete_task(&id, polled.task.task_id).await.unwrap();
    }
    engine.shutdown().await;

    // A fresh lease sees the persisted ack level.
    let info = store.lease_task_list(&id).await.unwrap();
    assert_eq!(info.ack_level, last_id);
}

#[tokio::test]
async fn test_range_roll_keeps_ids_monotonic() {
    let store = Arc::new(MemoryStore::new());
    let config = MatchingConfig {
        range_size: 3,
        ..MatchingConfig::default()
    };
    let engine = MatchingEngine::new(store, config);
    let id = TaskListId::new("test-domain", "rolling", TaskListType::Activity);

    let mut ids = Vec::new();
    for schedule_id in 0..8 {
        ids.push(
            add_task_retrying(&engine, TaskListType::Activity, add_request("rolling", schedule_id))
                .await,
        );
    }
    for pair in ids.windows(2) {
        assert!(
            pair[0] < pair[1],
            "ids must stay monotonic across range rolls: {ids:?}"
        );
    }
    // Eight appends never fit one 3-id block, so a roll definitely happened.
    assert!(*ids.last().unwrap() >= 2 * 3);

    // Everything is still deliverable in order.
    let mut delivered = Vec::new();
    while delivered.len() < ids.len() {
        match engine.poll_task(&id, Duration::from_secs(5)).await.unwrap() {
            Some(polled) => {
                delivered.push(polled.task.task_id);
                engine.complete_task(&id, polled.task.task_id).await.unwrap();
            }
            None => panic!("poll timed out before draining the list"),
        }
    }
    assert_eq!(delivered, ids);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_expired_tasks_discarded_on_redelivery_scan() {
    let store = Arc::new(MemoryStore::new());
    let config = MatchingConfig {
        dispatch_timeout: Duration::from_millis(100),
        idle_scan_interval: Duration::from_millis(50),
        ..MatchingConfig::default()
    };
    let id = TaskListId::new("test-domain", "expiring", TaskListType::Activity);

    // First incarnation writes tasks with a one-second expiry and never
    // serves a poller.
    let engine = MatchingEngine::new(store.clone(), config.clone());
    for schedule_id in [2, 4, 6] {
        let request = AddTaskRequest {
            schedule_to_start_timeout_seconds: 1,
            ..add_request("expiring", schedule_id)
        };
        engine.add_task(TaskListType::Activity, request).await.unwrap();
    }
    engine.shutdown().await;
    let undelivered = store.get_tasks(&id, 0, i64::MAX, 100).await.unwrap();
    assert_eq!(undelivered.len(), 3, "tasks must survive an unserved shutdown");

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    // The next incarnation scans the backlog, finds every task expired, and
    // discards them without delivering anything.
    let engine = MatchingEngine::new(store.clone(), config);
    let polled = engine.poll_task(&id, Duration::from_secs(2)).await.unwrap();
    assert!(polled.is_none(), "expired tasks must not be delivered");

    let remaining = store.get_tasks(&id, 0, i64::MAX, 100).await.unwrap();
    assert!(remaining.is_empty(), "expired tasks must be deleted");

    engine.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_appends_all_commit() {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(MatchingEngine::new(store.clone(), MatchingConfig::default()));
    let id = TaskListId::new("test-domain", "burst", TaskListType::Decision);

    let mut handles = Vec::new();
    for schedule_id in 0..50 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .add_task(TaskListType::Decision, add_request("burst", schedule_id))
                .await
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 50, "every append must get a distinct task id");

    let stored = store.get_tasks(&id, 0, i64::MAX, 100).await.unwrap();
    assert_eq!(stored.len(), 50);

    engine.shutdown().await;
}
