// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer queue processor: hands decision and activity tasks to matching.
//!
//! Transfer tasks are committed atomically with the workflow update that
//! produced them. This processor drains them in task id order, pushes each
//! to the matching service, deletes the row, and advances the shard's
//! transfer ack level. A failed delivery leaves the task for the next poll,
//! so handoff is at-least-once; the matching side dedupes by schedule id
//! when a worker reports the task started.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tempo_core::client::{AddTaskRequest, MatchingClient};
use tempo_core::error::Result;
use tempo_core::persistence::ExecutionStore;
use tempo_core::types::{TransferTaskType, WorkflowExecution};

use crate::shard::ShardContext;

/// Transfer queue processor tuning knobs.
#[derive(Debug, Clone)]
pub struct TransferQueueProcessorConfig {
    /// Rows fetched per transfer queue scan.
    pub batch_size: usize,
    /// Wake-up interval between scans.
    pub poll_interval: Duration,
}

impl Default for TransferQueueProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Drains one shard's transfer queue into the matching service.
pub struct TransferQueueProcessor {
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    matching: Arc<dyn MatchingClient>,
    config: TransferQueueProcessorConfig,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TransferQueueProcessor {
    /// Create a processor for a shard.
    pub fn new(
        shard: Arc<ShardContext>,
        execution_store: Arc<dyn ExecutionStore>,
        matching: Arc<dyn MatchingClient>,
        config: TransferQueueProcessorConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            shard,
            execution_store,
            matching,
            config,
            shutdown_tx,
            handle: Mutex::new(None),
        })
    }

    /// Start the processing loop. Idempotent; the second call is a no-op.
    pub async fn start(self: Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let processor = self.clone();
        *handle = Some(tokio::spawn(processor.run()));
    }

    /// Stop after the current cycle.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn run(self: Arc<Self>) {
        info!(shard_id = self.shard.shard_id(), "transfer queue processor started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut close_rx = self.shard.close_receiver();

        loop {
            if let Err(e) = self.process_pending_tasks().await {
                warn!(shard_id = self.shard.shard_id(), error = %e, "transfer cycle failed");
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = close_rx.changed() => {
                    if *close_rx.borrow() {
                        warn!(shard_id = self.shard.shard_id(), "shard closed, stopping transfer queue");
                        break;
                    }
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        info!(shard_id = self.shard.shard_id(), "transfer queue processor stopped");
    }

    async fn process_pending_tasks(&self) -> Result<()> {
        loop {
            let ack_level = self.shard.transfer_ack_level().await;
            let tasks = self
                .execution_store
                .get_transfer_tasks(
                    self.shard.shard_id(),
                    ack_level,
                    i64::MAX,
                    self.config.batch_size,
                )
                .await?;
            if tasks.is_empty() {
                return Ok(());
            }

            for task in tasks {
                let request = AddTaskRequest {
                    domain_id: task.domain_id.clone(),
                    execution: WorkflowExecution {
                        workflow_id: task.workflow_id.clone(),
                        run_id: task.run_id.clone(),
                    },
                    task_list: task.task_list.clone(),
                    schedule_id: task.schedule_id,
                    schedule_to_start_timeout_seconds: task.schedule_to_start_timeout_seconds,
                };
                let delivery = match task.task_type {
                    TransferTaskType::DecisionTask => self.matching.add_decision_task(request).await,
                    TransferTaskType::ActivityTask => self.matching.add_activity_task(request).await,
                };
                if let Err(e) = delivery {
                    // Leave the task and everything after it for the next
                    // poll; ack order must stay contiguous.
                    debug!(task_id = task.task_id, error = %e, "task handoff failed, will retry");
                    return Ok(());
                }

                self.execution_store
                    .complete_transfer_task(self.shard.shard_id(), task.task_id)
                    .await?;
                self.shard.update_transfer_ack_level(task.task_id).await?;
            }
        }
    }
}
