// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sequential, batched task appender with backpressure.
//!
//! All appends for a task list funnel through one loop, which is what makes
//! per-list task ids monotonic in commit order and lets bursts share a single
//! conditional write. Callers submit onto a bounded queue; a full queue fails
//! the submission immediately with a service-busy error rather than blocking.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use tempo_core::error::{CoreError, Result};
use tempo_core::persistence::{TaskInfo, TaskStore};
use tempo_core::types::{TaskListId, WorkflowExecution};

use crate::config::MatchingConfig;
use crate::task_list::TaskSequencer;

struct WriteTaskRequest {
    execution: WorkflowExecution,
    schedule_id: i64,
    expiry_time: Option<DateTime<Utc>>,
    /// The lease epoch the caller observed when submitting.
    range_id: i64,
    response_tx: oneshot::Sender<Result<i64>>,
}

/// Writes tasks sequentially to persistence for one task list.
pub struct TaskWriter {
    id: TaskListId,
    store: Arc<dyn TaskStore>,
    sequencer: Arc<TaskSequencer>,
    max_batch_size: usize,
    append_tx: mpsc::Sender<WriteTaskRequest>,
    append_rx: Mutex<Option<mpsc::Receiver<WriteTaskRequest>>>,
    max_read_level: Arc<AtomicI64>,
}

impl TaskWriter {
    /// Create a writer; [`start`](Self::start) must be called before appends
    /// make progress.
    pub fn new(
        store: Arc<dyn TaskStore>,
        sequencer: Arc<TaskSequencer>,
        id: TaskListId,
        config: &MatchingConfig,
    ) -> Self {
        let (append_tx, append_rx) = mpsc::channel(config.outstanding_task_appends_threshold);
        Self {
            id,
            store,
            sequencer,
            max_batch_size: config.max_task_batch_size,
            append_tx,
            append_rx: Mutex::new(Some(append_rx)),
            max_read_level: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Start the writer loop. The loop exits on shutdown, failing any still
    /// queued requests; an in-flight batch always completes first.
    pub async fn start(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        self.max_read_level
            .store(self.sequencer.peek_next().await - 1, Ordering::Release);
        let rx = self
            .append_rx
            .lock()
            .await
            .take()
            .unwrap_or_else(|| mpsc::channel(1).1);
        let loop_state = WriterLoop {
            id: self.id.clone(),
            store: self.store.clone(),
            sequencer: self.sequencer.clone(),
            max_batch_size: self.max_batch_size,
            max_read_level: self.max_read_level.clone(),
        };
        tokio::spawn(loop_state.run(rx, shutdown_rx))
    }

    /// Submit one append and wait for its batch to commit. Returns the
    /// assigned task id.
    ///
    /// Fails immediately with [`CoreError::ServiceBusy`] when the queue is at
    /// capacity; this is the backpressure signal and the caller must retry.
    pub async fn append_task(
        &self,
        execution: WorkflowExecution,
        schedule_id: i64,
        expiry_time: Option<DateTime<Utc>>,
        range_id: i64,
    ) -> Result<i64> {
        let (response_tx, response_rx) = oneshot::channel();
        let request = WriteTaskRequest {
            execution,
            schedule_id,
            expiry_time,
            range_id,
            response_tx,
        };
        self.append_tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CoreError::ServiceBusy {
                task_list: self.id.name.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => CoreError::ShuttingDown,
        })?;
        response_rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    /// Highest committed task id; the reader must not scan past it.
    pub fn max_read_level(&self) -> i64 {
        self.max_read_level.load(Ordering::Acquire)
    }

    /// Shared handle to the max-read-level counter.
    pub fn max_read_level_handle(&self) -> Arc<AtomicI64> {
        self.max_read_level.clone()
    }

    /// Remaining submission-queue capacity before backpressure kicks in.
    pub fn remaining_capacity(&self) -> usize {
        self.append_tx.capacity()
    }
}

struct WriterLoop {
    id: TaskListId,
    store: Arc<dyn TaskStore>,
    sequencer: Arc<TaskSequencer>,
    max_batch_size: usize,
    max_read_level: Arc<AtomicI64>,
}

impl WriterLoop {
    async fn run(
        self,
        mut rx: mpsc::Receiver<WriteTaskRequest>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(task_list = %self.id, "task writer started");
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }

                maybe_request = rx.recv() => {
                    let Some(request) = maybe_request else { break };
                    let mut requests = vec![request];
                    while requests.len() < self.max_batch_size {
                        match rx.try_recv() {
                            Ok(request) => requests.push(request),
                            Err(_) => break,
                        }
                    }
                    self.write_batch(requests).await;
                }
            }
        }

        // Fail whatever is still queued; nothing new can enter once the
        // receiver closes.
        rx.close();
        while let Ok(request) = rx.try_recv() {
            let _ = request.response_tx.send(Err(CoreError::ShuttingDown));
        }
        info!(task_list = %self.id, "task writer stopped");
    }

    async fn write_batch(&self, requests: Vec<WriteTaskRequest>) {
        let task_ids = match self.sequencer.next_task_ids(requests.len()).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(task_list = %self.id, error = %e, "task id allocation failed");
                for request in requests {
                    let _ = request.response_tx.send(Err(e.clone()));
                }
                return;
            }
        };

        // The batch commits with the highest lease any request carried. Id
        // allocation above may itself have rolled the range, in which case
        // this write fails the range check and every caller retries.
        let mut range_id = 0;
        let mut max_task_id = 0;
        let mut tasks = Vec::with_capacity(requests.len());
        for (request, &task_id) in requests.iter().zip(task_ids.iter()) {
            tasks.push(TaskInfo {
                task_id,
                domain_id: self.id.domain_id.clone(),
                workflow_id: request.execution.workflow_id.clone(),
                run_id: request.execution.run_id.clone(),
                schedule_id: request.schedule_id,
                expiry_time: request.expiry_time,
            });
            if request.range_id > range_id {
                range_id = request.range_id;
            }
            max_task_id = task_id;
        }

        let result = self.store.create_tasks(&self.id, tasks, range_id).await;
        if let Err(e) = &result {
            error!(
                task_list = %self.id,
                first_task_id = task_ids[0],
                last_task_id = max_task_id,
                error = %e,
                "task batch write failed"
            );
        } else {
            debug!(task_list = %self.id, batch = requests.len(), last_task_id = max_task_id, "task batch committed");
        }

        // Allocated ids are burned either way; publish so the reader can
        // move past them.
        if max_task_id > 0 {
            self.max_read_level.store(max_task_id, Ordering::Release);
        }

        for (request, task_id) in requests.into_iter().zip(task_ids.into_iter()) {
            let response = match &result {
                Ok(()) => Ok(task_id),
                Err(e) => Err(e.clone()),
            };
            let _ = request.response_tx.send(response);
        }
    }
}
