// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task writer backpressure and batching behavior.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use tempo_core::CoreError;
use tempo_core::persistence::{MemoryStore, TaskStore};
use tempo_core::types::{TaskListId, TaskListType, WorkflowExecution};
use tempo_matching::MatchingConfig;
use tempo_matching::task_list::TaskSequencer;
use tempo_matching::task_writer::TaskWriter;

fn execution() -> WorkflowExecution {
    WorkflowExecution {
        workflow_id: "w1".to_string(),
        run_id: "r1".to_string(),
    }
}

#[tokio::test]
async fn test_backpressure_at_capacity() {
    let store = Arc::new(MemoryStore::new());
    let config = MatchingConfig::default();
    let id = TaskListId::new("test-domain", "backpressure", TaskListType::Activity);
    let sequencer = TaskSequencer::acquire(store.clone(), id.clone(), config.range_size)
        .await
        .unwrap();
    let range_id = sequencer.range_id().await;
    let writer = Arc::new(TaskWriter::new(store.clone(), sequencer, id, &config));

    // Fill the append channel by not draining it: the loop is not running.
    let mut queued = Vec::new();
    for i in 0..config.outstanding_task_appends_threshold {
        let writer = writer.clone();
        queued.push(tokio::spawn(async move {
            writer
                .append_task(execution(), i as i64, None, range_id)
                .await
        }));
    }

    let mut waited = 0;
    while writer.remaining_capacity() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
        assert!(waited < 500, "append channel never filled");
    }

    // The 251st submission fails synchronously with service-busy and never
    // blocks.
    let err = writer
        .append_task(execution(), 999, None, range_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ServiceBusy { .. }));

    // Once the drain resumes, every queued submission commits and new ones
    // succeed again.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = writer.start(shutdown_rx).await;
    for task in queued {
        let result = task.await.unwrap();
        assert!(result.is_ok(), "queued append failed: {result:?}");
    }
    let task_id = writer
        .append_task(execution(), 1000, None, range_id)
        .await
        .unwrap();
    assert!(task_id > 0);

    let _ = shutdown_tx.send(true);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_committed_task_ids_are_monotonic() {
    let store = Arc::new(MemoryStore::new());
    let config = MatchingConfig::default();
    let id = TaskListId::new("test-domain", "monotonic", TaskListType::Activity);
    let sequencer = TaskSequencer::acquire(store.clone(), id.clone(), config.range_size)
        .await
        .unwrap();
    let range_id = sequencer.range_id().await;
    let writer = Arc::new(TaskWriter::new(store.clone(), sequencer, id.clone(), &config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = writer.start(shutdown_rx).await;

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(
            writer
                .append_task(execution(), i, None, range_id)
                .await
                .unwrap(),
        );
    }
    // Sequential awaited appends commit in order, so each id is strictly
    // greater than the previous.
    for pair in ids.windows(2) {
        assert!(pair[0] < pair[1], "task ids not monotonic: {ids:?}");
    }
    assert_eq!(writer.max_read_level(), *ids.last().unwrap());

    // Every committed task is observable.
    let stored = store.get_tasks(&id, 0, i64::MAX, 100).await.unwrap();
    assert_eq!(stored.len(), 20);

    let _ = shutdown_tx.send(true);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_fails_queued_requests() {
    let store = Arc::new(MemoryStore::new());
    let config = MatchingConfig::default();
    let id = TaskListId::new("test-domain", "shutdown", TaskListType::Activity);
    let sequencer = TaskSequencer::acquire(store.clone(), id.clone(), config.range_size)
        .await
        .unwrap();
    let range_id = sequencer.range_id().await;
    let writer = Arc::new(TaskWriter::new(store.clone(), sequencer, id, &config));

    // Queue a few requests with the loop stopped from the start.
    let mut queued = Vec::new();
    for i in 0..5 {
        let writer = writer.clone();
        queued.push(tokio::spawn(async move {
            writer.append_task(execution(), i, None, range_id).await
        }));
    }
    let mut waited = 0;
    while writer.remaining_capacity() > 250 - 5 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
        assert!(waited < 500, "appends never queued");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _ = shutdown_tx.send(true);
    let handle = writer.start(shutdown_rx).await;
    handle.await.unwrap();

    for task in queued {
        let result = task.await.unwrap();
        assert!(matches!(result, Err(CoreError::ShuttingDown)));
    }
}
