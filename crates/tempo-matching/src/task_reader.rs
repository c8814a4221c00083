// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Long-poll dispatch of durable tasks to pollers.
//!
//! The reader scans forward from the ack level, bounded by the writer's
//! committed high-water mark, and hands each live task to a waiting poller.
//! Expired tasks are completed on the spot; a task nobody polls for within
//! the dispatch timeout is skipped and stays durable for redelivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tracing::{debug, info, warn};

use tempo_core::error::Result;
use tempo_core::persistence::{TaskInfo, TaskStore};
use tempo_core::types::TaskListId;

use crate::config::MatchingConfig;
use crate::task_list::AckManager;

pub(crate) struct TaskReader {
    id: TaskListId,
    store: Arc<dyn TaskStore>,
    config: MatchingConfig,
    ack: Arc<Mutex<AckManager>>,
    max_read_level: Arc<AtomicI64>,
    dispatch_tx: mpsc::Sender<TaskInfo>,
    new_task_notify: Arc<Notify>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskReader {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        id: TaskListId,
        config: MatchingConfig,
        ack: Arc<Mutex<AckManager>>,
        max_read_level: Arc<AtomicI64>,
        dispatch_tx: mpsc::Sender<TaskInfo>,
        new_task_notify: Arc<Notify>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            store,
            config,
            ack,
            max_read_level,
            dispatch_tx,
            new_task_notify,
            shutdown_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(task_list = %self.id, "task reader started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = self.new_task_notify.notified() => {}

                _ = tokio::time::sleep(self.config.idle_scan_interval) => {}
            }

            if let Err(e) = self.dispatch_pending().await {
                warn!(task_list = %self.id, error = %e, "task dispatch cycle failed");
            }
        }
        info!(task_list = %self.id, "task reader stopped");
    }

    /// Scan and dispatch until the readable window is drained or shutdown.
    async fn dispatch_pending(&mut self) -> Result<()> {
        loop {
            let read_level = self.ack.lock().await.read_level();
            let max_read_level = self.max_read_level.load(Ordering::Acquire);
            if read_level >= max_read_level {
                return Ok(());
            }

            let tasks = self
                .store
                .get_tasks(
                    &self.id,
                    read_level,
                    max_read_level,
                    self.config.read_batch_size,
                )
                .await?;

            // A short page means the whole window was scanned; ids burned by
            // failed batches leave gaps the read level must still cross.
            let scanned_to = if tasks.len() < self.config.read_batch_size {
                max_read_level
            } else {
                tasks.last().map(|t| t.task_id).unwrap_or(max_read_level)
            };

            for task in tasks {
                self.ack.lock().await.add_task(task.task_id);

                if let Some(expiry) = task.expiry_time
                    && expiry <= Utc::now()
                {
                    debug!(task_list = %self.id, task_id = task.task_id, "task expired, discarding");
                    self.store.complete_task(&self.id, task.task_id).await?;
                    self.ack.lock().await.complete_task(task.task_id);
                    continue;
                }

                let task_id = task.task_id;
                match tokio::time::timeout(
                    self.config.dispatch_timeout,
                    self.dispatch_tx.send(task),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return Ok(()), // poll side dropped; shutting down
                    Err(_) => {
                        // No poller showed up; leave the task durable and let
                        // the completion path or a restart pick it up.
                        debug!(task_list = %self.id, task_id, "no poller within dispatch timeout, skipping");
                    }
                }

                if *self.shutdown_rx.borrow() {
                    return Ok(());
                }
            }

            self.ack.lock().await.set_read_level(scanned_to);
        }
    }
}
