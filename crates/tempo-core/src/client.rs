// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service client traits consumed across crate boundaries.
//!
//! The history service hands transfer tasks to the matching service through
//! [`MatchingClient`]. In a deployed topology this seam is an RPC client; in
//! this workspace the matching engine implements it directly and tests plug
//! in mocks.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::WorkflowExecution;

/// A request to enqueue one task on a task list.
#[derive(Debug, Clone)]
pub struct AddTaskRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The workflow execution the task belongs to.
    pub execution: WorkflowExecution,
    /// Target task list name.
    pub task_list: String,
    /// The schedule event the task refers to.
    pub schedule_id: i64,
    /// Schedule-to-start timeout in seconds (0 = the task never expires).
    pub schedule_to_start_timeout_seconds: i32,
}

/// Client surface of the matching service.
#[async_trait]
pub trait MatchingClient: Send + Sync {
    /// Enqueue a decision task for dispatch to a decision poller.
    async fn add_decision_task(&self, request: AddTaskRequest) -> Result<()>;

    /// Enqueue an activity task for dispatch to an activity poller.
    async fn add_activity_task(&self, request: AddTaskRequest) -> Result<()>;
}
