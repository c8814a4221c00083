// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-list manager: range lease, task id blocks, and the sparse ack manager.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tempo_core::error::{CoreError, Result};
use tempo_core::persistence::{TaskInfo, TaskListInfo, TaskStore};
use tempo_core::types::{TaskListId, WorkflowExecution};

use crate::config::MatchingConfig;
use crate::task_reader::TaskReader;
use crate::task_writer::TaskWriter;

/// Allocates monotonically increasing task ids for one task list under its
/// range lease.
///
/// Each lease epoch `range_id` covers the block
/// `[range_id * range_size, range_id * range_size + range_size)`. Exhausting
/// the block transparently re-leases the list; the store rejects writes from
/// the previous epoch from then on.
pub struct TaskSequencer {
    id: TaskListId,
    store: Arc<dyn TaskStore>,
    range_size: i64,
    state: Mutex<SequencerState>,
}

struct SequencerState {
    range_id: i64,
    next: i64,
    max: i64,
    ack_level: i64,
}

impl TaskSequencer {
    /// Acquire the lease for `id` and position the counter at the start of
    /// the leased block.
    pub async fn acquire(
        store: Arc<dyn TaskStore>,
        id: TaskListId,
        range_size: i64,
    ) -> Result<Arc<Self>> {
        let info = store.lease_task_list(&id).await?;
        info!(task_list = %id, range_id = info.range_id, ack_level = info.ack_level, "task list leased");
        Ok(Arc::new(Self {
            id,
            store,
            range_size,
            state: Mutex::new(SequencerState {
                range_id: info.range_id,
                next: info.range_id * range_size,
                max: info.range_id * range_size + range_size,
                ack_level: info.ack_level,
            }),
        }))
    }

    /// Allocate `count` consecutive task ids, re-leasing when the current
    /// block runs out.
    pub async fn next_task_ids(&self, count: usize) -> Result<Vec<i64>> {
        let mut state = self.state.lock().await;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            if state.next >= state.max {
                let info = self.store.lease_task_list(&self.id).await?;
                info!(task_list = %self.id, range_id = info.range_id, "task list range renewed");
                state.range_id = info.range_id;
                state.next = info.range_id * self.range_size;
                state.max = info.range_id * self.range_size + self.range_size;
            }
            ids.push(state.next);
            state.next += 1;
        }
        Ok(ids)
    }

    /// The next id that will be handed out, without consuming it.
    pub async fn peek_next(&self) -> i64 {
        self.state.lock().await.next
    }

    /// The current lease epoch.
    pub async fn range_id(&self) -> i64 {
        self.state.lock().await.range_id
    }

    /// The ack level observed when the lease was acquired.
    pub async fn initial_ack_level(&self) -> i64 {
        self.state.lock().await.ack_level
    }
}

/// Sparse completion tracking for dispatched tasks.
///
/// `ack_level` advances only through the lowest contiguous run of completed
/// task ids; it is non-decreasing and never exceeds the read level.
#[derive(Debug)]
pub struct AckManager {
    outstanding: BTreeMap<i64, bool>,
    read_level: i64,
    ack_level: i64,
}

impl AckManager {
    /// Start tracking from a persisted ack level.
    pub fn new(ack_level: i64) -> Self {
        Self {
            outstanding: BTreeMap::new(),
            read_level: ack_level,
            ack_level,
        }
    }

    /// Record a task handed to the dispatcher.
    pub fn add_task(&mut self, task_id: i64) {
        self.outstanding.insert(task_id, false);
        if task_id > self.read_level {
            self.read_level = task_id;
        }
    }

    /// Highest task id the reader has scanned past.
    pub fn read_level(&self) -> i64 {
        self.read_level
    }

    /// Move the read level forward over a scanned-but-empty id range.
    pub fn set_read_level(&mut self, read_level: i64) {
        if read_level > self.read_level {
            self.read_level = read_level;
        }
    }

    /// Mark a task completed and advance the ack level through the lowest
    /// contiguous completed run. Returns the (possibly unchanged) ack level.
    pub fn complete_task(&mut self, task_id: i64) -> i64 {
        if let Some(done) = self.outstanding.get_mut(&task_id) {
            *done = true;
        }
        while let Some((&first_id, &done)) = self.outstanding.iter().next() {
            if !done {
                break;
            }
            self.outstanding.remove(&first_id);
            self.ack_level = first_id;
        }
        self.ack_level
    }

    /// Lowest contiguously-completed task id.
    pub fn ack_level(&self) -> i64 {
        self.ack_level
    }
}

/// A task handed to a poller, with what it needs to ack it.
#[derive(Debug, Clone)]
pub struct PolledTask {
    /// The durable task.
    pub task: TaskInfo,
}

/// Owns one task list: its lease, writer, reader, and completion tracking.
pub struct TaskListManager {
    id: TaskListId,
    store: Arc<dyn TaskStore>,
    sequencer: Arc<TaskSequencer>,
    writer: TaskWriter,
    ack: Arc<Mutex<AckManager>>,
    dispatch_rx: Mutex<mpsc::Receiver<TaskInfo>>,
    new_task_notify: Arc<tokio::sync::Notify>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskListManager {
    /// Lease the task list and start its writer and reader loops.
    pub async fn start(
        store: Arc<dyn TaskStore>,
        id: TaskListId,
        config: MatchingConfig,
    ) -> Result<Arc<Self>> {
        let sequencer = TaskSequencer::acquire(store.clone(), id.clone(), config.range_size).await?;
        let ack = Arc::new(Mutex::new(AckManager::new(
            sequencer.initial_ack_level().await,
        )));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(1);
        let new_task_notify = Arc::new(tokio::sync::Notify::new());

        let writer = TaskWriter::new(store.clone(), sequencer.clone(), id.clone(), &config);
        let writer_handle = writer.start(shutdown_rx.clone()).await;

        let reader = TaskReader::new(
            store.clone(),
            id.clone(),
            config,
            ack.clone(),
            writer.max_read_level_handle(),
            dispatch_tx,
            new_task_notify.clone(),
            shutdown_rx,
        );
        let reader_handle = tokio::spawn(reader.run());

        Ok(Arc::new(Self {
            id,
            store,
            sequencer,
            writer,
            ack,
            dispatch_rx: Mutex::new(dispatch_rx),
            new_task_notify,
            shutdown_tx,
            handles: Mutex::new(vec![writer_handle, reader_handle]),
        }))
    }

    /// The task list this manager owns.
    pub fn id(&self) -> &TaskListId {
        &self.id
    }

    /// Append one task; returns its assigned task id.
    ///
    /// Fails immediately with a service-busy error when the writer's input
    /// queue is full; the caller retries with backoff.
    pub async fn add_task(
        &self,
        execution: WorkflowExecution,
        schedule_id: i64,
        schedule_to_start_timeout_seconds: i32,
    ) -> Result<i64> {
        let expiry_time = (schedule_to_start_timeout_seconds > 0)
            .then(|| Utc::now() + Duration::seconds(schedule_to_start_timeout_seconds as i64));
        let range_id = self.sequencer.range_id().await;
        let task_id = self
            .writer
            .append_task(execution, schedule_id, expiry_time, range_id)
            .await?;
        self.new_task_notify.notify_one();
        Ok(task_id)
    }

    /// Wait up to `wait` for a dispatched task.
    ///
    /// Returns `Ok(None)` when the deadline passes without a match.
    pub async fn poll_task(&self, wait: std::time::Duration) -> Result<Option<PolledTask>> {
        let mut rx = self.dispatch_rx.lock().await;
        match tokio::time::timeout(wait, rx.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(CoreError::ShuttingDown),
            Ok(Some(task)) => Ok(Some(PolledTask { task })),
        }
    }

    /// Acknowledge a delivered task: delete its row and advance the ack
    /// level through the lowest contiguous completed run.
    pub async fn complete_task(&self, task_id: i64) -> Result<()> {
        self.store.complete_task(&self.id, task_id).await?;

        let mut ack = self.ack.lock().await;
        let before = ack.ack_level();
        let after = ack.complete_task(task_id);
        drop(ack);

        if after > before {
            let info = TaskListInfo {
                domain_id: self.id.domain_id.clone(),
                name: self.id.name.clone(),
                task_type: self.id.task_type,
                range_id: self.sequencer.range_id().await,
                ack_level: after,
            };
            if let Err(e) = self.store.update_task_list(info).await {
                warn!(task_list = %self.id, error = %e, "failed to persist ack level");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Highest task id the reader may safely scan to.
    pub fn max_read_level(&self) -> i64 {
        self.writer.max_read_level()
    }

    /// Current in-memory ack level.
    pub async fn ack_level(&self) -> i64 {
        self.ack.lock().await.ack_level()
    }

    /// Stop the writer and reader loops. Queued appends receive a shutdown
    /// error; the in-flight batch is allowed to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        info!(task_list = %self.id, "task list manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_manager_contiguous_advance() {
        let mut ack = AckManager::new(0);
        ack.add_task(1);
        ack.add_task(2);
        ack.add_task(3);
        assert_eq!(ack.read_level(), 3);

        // Completing out of order does not advance past the gap.
        assert_eq!(ack.complete_task(2), 0);
        assert_eq!(ack.complete_task(3), 0);
        // Filling the gap releases the whole run.
        assert_eq!(ack.complete_task(1), 3);
        assert_eq!(ack.ack_level(), 3);
    }

    #[test]
    fn test_ack_manager_monotone_and_bounded() {
        let mut ack = AckManager::new(10);
        ack.add_task(11);
        ack.add_task(13);
        let mut last = ack.ack_level();
        for id in [13, 11] {
            let level = ack.complete_task(id);
            assert!(level >= last, "ack level regressed");
            assert!(level <= ack.read_level());
            last = level;
        }
        // 12 was never added (burned id); the run 11..13 is still contiguous
        // among outstanding tasks.
        assert_eq!(ack.ack_level(), 13);
    }

    #[test]
    fn test_ack_manager_unknown_completion_is_ignored() {
        let mut ack = AckManager::new(5);
        assert_eq!(ack.complete_task(99), 5);
        assert_eq!(ack.ack_level(), 5);
    }

    #[test]
    fn test_ack_manager_read_level_moves_over_empty_ranges() {
        let mut ack = AckManager::new(0);
        ack.set_read_level(40);
        assert_eq!(ack.read_level(), 40);
        ack.set_read_level(30);
        assert_eq!(ack.read_level(), 40);
    }
}
