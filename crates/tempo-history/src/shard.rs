// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shard context: range lease ownership and monotonic sequence allocation.
//!
//! One process owns a shard at a time through its `range_id` lease. The
//! context allocates task ids out of the leased block
//! `[range_id * range_size, range_id * range_size + range_size)` and renews
//! the lease transparently when the block runs out. A failed renewal means
//! another process took the shard over: the context closes, fires the close
//! broadcast, and refuses every further write.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use tempo_core::error::{CoreError, Result};
use tempo_core::persistence::{
    CreateWorkflowExecutionRequest, ExecutionStore, ShardInfo, ShardStore,
    UpdateWorkflowExecutionRequest,
};

use crate::timer_builder::SequenceNumberGenerator;

/// Task ids allocated per lease epoch.
pub const DEFAULT_RANGE_SIZE: i64 = 100_000;

struct ShardState {
    info: ShardInfo,
    sequence: i64,
    max_sequence: i64,
    closed: bool,
}

/// Owns a shard's range lease and its monotonic sequence counter.
pub struct ShardContext {
    shard_id: i32,
    range_size: i64,
    shard_store: Arc<dyn ShardStore>,
    execution_store: Arc<dyn ExecutionStore>,
    state: Mutex<ShardState>,
    close_tx: watch::Sender<bool>,
}

impl ShardContext {
    /// Acquire the shard: bump its `range_id` under compare-and-set and
    /// position the sequence counter at the start of the new block.
    pub async fn acquire(
        shard_store: Arc<dyn ShardStore>,
        execution_store: Arc<dyn ExecutionStore>,
        shard_id: i32,
        range_size: i64,
    ) -> Result<Arc<Self>> {
        let mut info = shard_store.get_or_create_shard(shard_id).await?;
        let previous_range_id = info.range_id;
        info.range_id += 1;
        shard_store.update_shard(info.clone(), previous_range_id).await?;
        info!(shard_id, range_id = info.range_id, "shard acquired");

        let (close_tx, _) = watch::channel(false);
        let sequence = info.range_id * range_size;
        let max_sequence = sequence + range_size;
        Ok(Arc::new(Self {
            shard_id,
            range_size,
            shard_store,
            execution_store,
            state: Mutex::new(ShardState {
                info,
                sequence,
                max_sequence,
                closed: false,
            }),
            close_tx,
        }))
    }

    /// The shard this context owns.
    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    /// Subscribe to the shard close broadcast. The signal is a watch value,
    /// so a close is always observable no matter when the owner looks.
    pub fn close_receiver(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// Whether the lease has been lost.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// The current lease epoch.
    pub async fn range_id(&self) -> i64 {
        self.state.lock().await.info.range_id
    }

    /// Allocate the next transfer task id, renewing the range when the
    /// current block is exhausted.
    pub async fn next_transfer_task_id(&self) -> Result<i64> {
        self.allocate_task_id().await
    }

    /// Allocate the next timer task sequence number. Timer and transfer
    /// tasks share the shard's counter, so commit order stays totally
    /// ordered per shard.
    pub async fn next_timer_sequence_number(&self) -> Result<i64> {
        self.allocate_task_id().await
    }

    async fn allocate_task_id(&self) -> Result<i64> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(self.closed_error());
        }
        if state.sequence >= state.max_sequence {
            let mut info = state.info.clone();
            let previous_range_id = info.range_id;
            info.range_id += 1;
            match self.shard_store.update_shard(info.clone(), previous_range_id).await {
                Ok(()) => {
                    info!(shard_id = self.shard_id, range_id = info.range_id, "shard range renewed");
                    state.sequence = info.range_id * self.range_size;
                    state.max_sequence = state.sequence + self.range_size;
                    state.info = info;
                }
                Err(e) => {
                    self.mark_closed(&mut state, &e);
                    return Err(e);
                }
            }
        }
        let task_id = state.sequence;
        state.sequence += 1;
        Ok(task_id)
    }

    /// Highest transfer task id acknowledged by the transfer processor.
    pub async fn transfer_ack_level(&self) -> i64 {
        self.state.lock().await.info.transfer_ack_level
    }

    /// Persist a new transfer ack level under the current lease.
    pub async fn update_transfer_ack_level(&self, level: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(self.closed_error());
        }
        let mut info = state.info.clone();
        info.transfer_ack_level = level;
        match self.shard_store.update_shard(info.clone(), info.range_id).await {
            Ok(()) => {
                state.info = info;
                Ok(())
            }
            Err(e) => {
                if e.is_ownership_lost() {
                    self.mark_closed(&mut state, &e);
                }
                Err(e)
            }
        }
    }

    /// Restart floor for the timer index scan.
    pub async fn timer_ack_level(&self) -> DateTime<Utc> {
        self.state.lock().await.info.timer_ack_level
    }

    /// Persist a new timer ack level under the current lease.
    pub async fn update_timer_ack_level(&self, level: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(self.closed_error());
        }
        let mut info = state.info.clone();
        info.timer_ack_level = level;
        match self.shard_store.update_shard(info.clone(), info.range_id).await {
            Ok(()) => {
                state.info = info;
                Ok(())
            }
            Err(e) => {
                if e.is_ownership_lost() {
                    self.mark_closed(&mut state, &e);
                }
                Err(e)
            }
        }
    }

    /// Create a workflow execution through this shard: assigns task ids to
    /// unassigned outbound tasks, stamps the lease, and writes.
    pub async fn create_workflow_execution(
        &self,
        mut request: CreateWorkflowExecutionRequest,
    ) -> Result<()> {
        self.prepare_tasks(&mut request.transfer_tasks, &mut request.timer_tasks)
            .await?;
        request.shard_id = self.shard_id;
        request.range_id = self.range_id().await;
        let result = self.execution_store.create_workflow_execution(request).await;
        self.observe_write_result(result).await
    }

    /// Update a workflow execution through this shard: assigns task ids to
    /// unassigned outbound tasks, stamps the lease, and writes conditionally.
    pub async fn update_workflow_execution(
        &self,
        mut request: UpdateWorkflowExecutionRequest,
    ) -> Result<()> {
        self.prepare_tasks(&mut request.transfer_tasks, &mut request.timer_tasks)
            .await?;
        request.shard_id = self.shard_id;
        request.range_id = self.range_id().await;
        let result = self.execution_store.update_workflow_execution(request).await;
        self.observe_write_result(result).await
    }

    async fn prepare_tasks(
        &self,
        transfer_tasks: &mut [tempo_core::persistence::TransferTaskInfo],
        timer_tasks: &mut [tempo_core::persistence::TimerTaskInfo],
    ) -> Result<()> {
        for task in transfer_tasks.iter_mut() {
            if task.task_id == 0 {
                task.task_id = self.next_transfer_task_id().await?;
            }
        }
        for task in timer_tasks.iter_mut() {
            if task.task_id == 0 {
                task.task_id = self.next_timer_sequence_number().await?;
            }
        }
        Ok(())
    }

    /// A rejected lease is fatal: close the shard so no further writes are
    /// issued until a higher range is re-acquired.
    async fn observe_write_result(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result
            && e.is_ownership_lost()
        {
            let mut state = self.state.lock().await;
            self.mark_closed(&mut state, e);
        }
        result
    }

    fn mark_closed(&self, state: &mut ShardState, cause: &CoreError) {
        if !state.closed {
            warn!(shard_id = self.shard_id, error = %cause, "shard lease lost, closing");
            state.closed = true;
            let _ = self.close_tx.send(true);
        }
    }

    fn closed_error(&self) -> CoreError {
        CoreError::ShardOwnershipLost {
            shard_id: self.shard_id,
            details: "shard is closed".to_string(),
        }
    }
}

#[async_trait]
impl SequenceNumberGenerator for ShardContext {
    async fn next_sequence_number(&self) -> Result<i64> {
        self.next_timer_sequence_number().await
    }
}
