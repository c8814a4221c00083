// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The matching engine: one task list manager per queue, created on demand.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use tempo_core::client::{AddTaskRequest, MatchingClient};
use tempo_core::error::Result;
use tempo_core::persistence::TaskStore;
use tempo_core::types::{TaskListId, TaskListType};

use crate::config::MatchingConfig;
use crate::task_list::{PolledTask, TaskListManager};

/// Routes task appends and polls to per-list managers.
pub struct MatchingEngine {
    store: Arc<dyn TaskStore>,
    config: MatchingConfig,
    task_lists: Mutex<HashMap<TaskListId, Arc<TaskListManager>>>,
}

impl MatchingEngine {
    /// Create an engine over a task store.
    pub fn new(store: Arc<dyn TaskStore>, config: MatchingConfig) -> Self {
        Self {
            store,
            config,
            task_lists: Mutex::new(HashMap::new()),
        }
    }

    /// Get or lazily start the manager for a task list.
    async fn manager(&self, id: &TaskListId) -> Result<Arc<TaskListManager>> {
        let mut task_lists = self.task_lists.lock().await;
        if let Some(manager) = task_lists.get(id) {
            return Ok(manager.clone());
        }
        let manager =
            TaskListManager::start(self.store.clone(), id.clone(), self.config.clone()).await?;
        task_lists.insert(id.clone(), manager.clone());
        Ok(manager)
    }

    /// Append one task; returns its assigned task id.
    pub async fn add_task(&self, task_type: TaskListType, request: AddTaskRequest) -> Result<i64> {
        let id = TaskListId::new(request.domain_id.clone(), request.task_list.clone(), task_type);
        let manager = self.manager(&id).await?;
        manager
            .add_task(
                request.execution,
                request.schedule_id,
                request.schedule_to_start_timeout_seconds,
            )
            .await
    }

    /// Long-poll one task from a list, waiting up to `wait`.
    pub async fn poll_task(&self, id: &TaskListId, wait: Duration) -> Result<Option<PolledTask>> {
        let manager = self.manager(id).await?;
        manager.poll_task(wait).await
    }

    /// Acknowledge a delivered task.
    pub async fn complete_task(&self, id: &TaskListId, task_id: i64) -> Result<()> {
        let manager = self.manager(id).await?;
        manager.complete_task(task_id).await
    }

    /// Stop every task list manager.
    pub async fn shutdown(&self) {
        let managers: Vec<_> = {
            let mut task_lists = self.task_lists.lock().await;
            task_lists.drain().map(|(_, manager)| manager).collect()
        };
        for manager in managers {
            manager.shutdown().await;
        }
        info!("matching engine stopped");
    }
}

#[async_trait]
impl MatchingClient for MatchingEngine {
    async fn add_decision_task(&self, request: AddTaskRequest) -> Result<()> {
        self.add_task(TaskListType::Decision, request).await?;
        Ok(())
    }

    async fn add_activity_task(&self, request: AddTaskRequest) -> Result<()> {
        self.add_task(TaskListType::Activity, request).await?;
        Ok(())
    }
}
