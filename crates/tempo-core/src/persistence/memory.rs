// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backend.
//!
//! Implements every store trait over plain maps behind one async mutex.
//! Used by unit and integration tests, and usable as an embedded volatile
//! backend. Conditional-write semantics are identical to the durable backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::error::{CoreError, Result};
use crate::types::{TaskListId, WorkflowExecution, WorkflowState};

use super::{
    CreateWorkflowExecutionRequest, DEFAULT_CLOSE_TTL_SECONDS, ExecutionStore,
    ListExecutionsRequest, ListExecutionsResponse, RecordExecutionClosedRequest,
    RecordExecutionStartedRequest, ShardInfo, ShardStore, TaskInfo, TaskListInfo, TaskStore,
    TimerTaskInfo, TransferTaskInfo, UpdateWorkflowExecutionRequest, VisibilityFilter,
    VisibilityStore, WorkflowExecutionInfo, WorkflowExecutionRecord, WorkflowMutableState,
};

type ExecutionKey = (String, String, String);

#[derive(Debug, Clone)]
struct ExecutionEntry {
    info: WorkflowExecutionInfo,
    activity_infos: HashMap<i64, super::ActivityInfo>,
    timer_infos: HashMap<String, super::TimerInfo>,
    decision: Option<super::DecisionInfo>,
}

#[derive(Debug, Clone)]
struct ClosedRecord {
    record: WorkflowExecutionRecord,
    expiry: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    shards: HashMap<i32, ShardInfo>,
    executions: HashMap<ExecutionKey, ExecutionEntry>,
    // (domain_id, workflow_id) -> run_id of the latest attempt
    current_runs: HashMap<(String, String), String>,
    timer_tasks: BTreeMap<(i32, DateTime<Utc>, i64), TimerTaskInfo>,
    transfer_tasks: BTreeMap<(i32, i64), TransferTaskInfo>,
    task_lists: HashMap<TaskListId, TaskListInfo>,
    tasks: HashMap<TaskListId, BTreeMap<i64, TaskInfo>>,
    // domain_id -> rows
    open_executions: HashMap<String, Vec<WorkflowExecutionRecord>>,
    closed_executions: HashMap<String, Vec<ClosedRecord>>,
}

/// In-memory store implementing all persistence traits.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently in a shard's timer index. Test hook.
    pub async fn timer_task_count(&self, shard_id: i32) -> usize {
        let inner = self.inner.lock().await;
        inner
            .timer_tasks
            .range((shard_id, DateTime::<Utc>::UNIX_EPOCH, i64::MIN)..)
            .take_while(|((s, _, _), _)| *s == shard_id)
            .count()
    }
}

fn execution_key(domain_id: &str, execution: &WorkflowExecution) -> ExecutionKey {
    (
        domain_id.to_string(),
        execution.workflow_id.clone(),
        execution.run_id.clone(),
    )
}

impl Inner {
    fn check_shard_range(&self, shard_id: i32, range_id: i64, operation: &str) -> Result<()> {
        let shard = self
            .shards
            .get(&shard_id)
            .ok_or_else(|| CoreError::NotFound(format!("shard {shard_id}")))?;
        if shard.range_id != range_id {
            return Err(CoreError::ShardOwnershipLost {
                shard_id,
                details: format!(
                    "{operation} carried range_id {range_id}, store has {}",
                    shard.range_id
                ),
            });
        }
        Ok(())
    }

    fn insert_tasks(
        &mut self,
        shard_id: i32,
        transfer_tasks: Vec<TransferTaskInfo>,
        timer_tasks: Vec<TimerTaskInfo>,
    ) {
        for task in transfer_tasks {
            self.transfer_tasks.insert((shard_id, task.task_id), task);
        }
        for task in timer_tasks {
            self.timer_tasks
                .insert((shard_id, task.visibility_time, task.task_id), task);
        }
    }
}

#[async_trait]
impl ShardStore for MemoryStore {
    async fn get_or_create_shard(&self, shard_id: i32) -> Result<ShardInfo> {
        let mut inner = self.inner.lock().await;
        let shard = inner.shards.entry(shard_id).or_insert_with(|| ShardInfo {
            shard_id,
            range_id: 0,
            transfer_ack_level: 0,
            timer_ack_level: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: Utc::now(),
        });
        Ok(shard.clone())
    }

    async fn update_shard(&self, shard: ShardInfo, previous_range_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .shards
            .get_mut(&shard.shard_id)
            .ok_or_else(|| CoreError::NotFound(format!("shard {}", shard.shard_id)))?;
        if stored.range_id != previous_range_id {
            return Err(CoreError::ShardOwnershipLost {
                shard_id: shard.shard_id,
                details: format!(
                    "update_shard expected range_id {previous_range_id}, store has {}",
                    stored.range_id
                ),
            });
        }
        *stored = ShardInfo {
            updated_at: Utc::now(),
            ..shard
        };
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_shard_range(request.shard_id, request.range_id, "create_workflow_execution")?;

        let info = request.info;
        let current_key = (info.domain_id.clone(), info.workflow_id.clone());
        if let Some(run_id) = inner.current_runs.get(&current_key) {
            let key = (
                info.domain_id.clone(),
                info.workflow_id.clone(),
                run_id.clone(),
            );
            if let Some(existing) = inner.executions.get(&key)
                && existing.info.state == WorkflowState::Running
            {
                return Err(CoreError::ExecutionAlreadyStarted {
                    workflow_id: info.workflow_id.clone(),
                    run_id: run_id.clone(),
                });
            }
        }

        inner
            .current_runs
            .insert(current_key, info.run_id.clone());
        let key = (
            info.domain_id.clone(),
            info.workflow_id.clone(),
            info.run_id.clone(),
        );
        inner.executions.insert(
            key,
            ExecutionEntry {
                info,
                activity_infos: HashMap::new(),
                timer_infos: HashMap::new(),
                decision: request.decision,
            },
        );
        inner.insert_tasks(request.shard_id, request.transfer_tasks, request.timer_tasks);
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecutionInfo> {
        let inner = self.inner.lock().await;
        inner
            .executions
            .get(&execution_key(domain_id, execution))
            .map(|entry| entry.info.clone())
            .ok_or_else(|| CoreError::ExecutionNotFound {
                workflow_id: execution.workflow_id.clone(),
                run_id: execution.run_id.clone(),
            })
    }

    async fn get_workflow_mutable_state(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowMutableState> {
        let inner = self.inner.lock().await;
        let entry = inner
            .executions
            .get(&execution_key(domain_id, execution))
            .ok_or_else(|| CoreError::ExecutionNotFound {
                workflow_id: execution.workflow_id.clone(),
                run_id: execution.run_id.clone(),
            })?;
        Ok(WorkflowMutableState {
            activity_infos: entry.activity_infos.clone(),
            timer_infos: entry.timer_infos.clone(),
            decision: entry.decision.clone(),
            next_event_id: entry.info.next_event_id,
            state: Some(entry.info.state),
        })
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_shard_range(request.shard_id, request.range_id, "update_workflow_execution")?;

        let info = request.info.ok_or_else(|| {
            CoreError::InvalidArgument("update_workflow_execution requires info".to_string())
        })?;
        let key = (
            info.domain_id.clone(),
            info.workflow_id.clone(),
            info.run_id.clone(),
        );
        let entry = inner
            .executions
            .get_mut(&key)
            .ok_or_else(|| CoreError::ExecutionNotFound {
                workflow_id: info.workflow_id.clone(),
                run_id: info.run_id.clone(),
            })?;

        if entry.info.next_event_id != request.condition {
            return Err(CoreError::ConditionFailed {
                operation: "update_workflow_execution".to_string(),
                details: format!(
                    "expected next_event_id {}, store has {}",
                    request.condition, entry.info.next_event_id
                ),
            });
        }

        entry.info = WorkflowExecutionInfo {
            last_updated: Utc::now(),
            ..info
        };
        for activity in request.upsert_activity_infos {
            entry.activity_infos.insert(activity.schedule_id, activity);
        }
        for schedule_id in request.delete_activity_infos {
            entry.activity_infos.remove(&schedule_id);
        }
        for timer in request.upsert_timer_infos {
            entry.timer_infos.insert(timer.timer_id.clone(), timer);
        }
        for timer_id in request.delete_timer_infos {
            entry.timer_infos.remove(&timer_id);
        }
        if request.clear_decision {
            entry.decision = None;
        }
        if request.decision.is_some() {
            entry.decision = request.decision;
        }

        inner.insert_tasks(request.shard_id, request.transfer_tasks, request.timer_tasks);
        Ok(())
    }

    async fn get_timer_index_tasks(
        &self,
        shard_id: i32,
        min_visibility: DateTime<Utc>,
        max_visibility: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<TimerTaskInfo>> {
        let inner = self.inner.lock().await;
        let start = (shard_id, min_visibility, i64::MIN);
        let end = (shard_id, max_visibility, i64::MIN);
        Ok(inner
            .timer_tasks
            .range(start..end)
            .take(batch_size)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn complete_timer_task(
        &self,
        shard_id: i32,
        visibility_time: DateTime<Utc>,
        task_id: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.timer_tasks.remove(&(shard_id, visibility_time, task_id));
        Ok(())
    }

    async fn get_transfer_tasks(
        &self,
        shard_id: i32,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TransferTaskInfo>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transfer_tasks
            .range((shard_id, read_level + 1)..=(shard_id, max_read_level))
            .take(batch_size)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn complete_transfer_task(&self, shard_id: i32, task_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.transfer_tasks.remove(&(shard_id, task_id));
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn lease_task_list(&self, id: &TaskListId) -> Result<TaskListInfo> {
        let mut inner = self.inner.lock().await;
        let info = inner
            .task_lists
            .entry(id.clone())
            .or_insert_with(|| TaskListInfo {
                domain_id: id.domain_id.clone(),
                name: id.name.clone(),
                task_type: id.task_type,
                range_id: 0,
                ack_level: 0,
            });
        info.range_id += 1;
        Ok(info.clone())
    }

    async fn update_task_list(&self, info: TaskListInfo) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let id = TaskListId::new(info.domain_id.clone(), info.name.clone(), info.task_type);
        let stored = inner
            .task_lists
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("task list {id}")))?;
        if stored.range_id != info.range_id {
            return Err(CoreError::TaskListOwnershipLost {
                task_list: id.to_string(),
                details: format!(
                    "update carried range_id {}, store has {}",
                    info.range_id, stored.range_id
                ),
            });
        }
        *stored = info;
        Ok(())
    }

    async fn create_tasks(
        &self,
        id: &TaskListId,
        tasks: Vec<TaskInfo>,
        range_id: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .task_lists
            .get(id)
            .ok_or_else(|| CoreError::NotFound(format!("task list {id}")))?;
        if stored.range_id != range_id {
            return Err(CoreError::ConditionFailed {
                operation: "create_tasks".to_string(),
                details: format!(
                    "carried range_id {range_id}, store has {}",
                    stored.range_id
                ),
            });
        }
        let list = inner.tasks.entry(id.clone()).or_default();
        for task in tasks {
            list.insert(task.task_id, task);
        }
        Ok(())
    }

    async fn get_tasks(
        &self,
        id: &TaskListId,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TaskInfo>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .get(id)
            .map(|list| {
                list.range(read_level + 1..=max_read_level)
                    .take(batch_size)
                    .map(|(_, task)| task.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn complete_task(&self, id: &TaskListId, task_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(list) = inner.tasks.get_mut(id) {
            list.remove(&task_id);
        }
        Ok(())
    }
}

fn matches_filter(record: &WorkflowExecutionRecord, filter: &Option<VisibilityFilter>) -> bool {
    match filter {
        None => true,
        Some(VisibilityFilter::WorkflowType(name)) => record.workflow_type == *name,
        Some(VisibilityFilter::WorkflowId(id)) => record.execution.workflow_id == *id,
        Some(VisibilityFilter::Status(status)) => record.status == Some(*status),
    }
}

fn decode_page_token(token: &Option<Vec<u8>>) -> Result<usize> {
    match token {
        None => Ok(0),
        Some(bytes) => serde_json::from_slice::<usize>(bytes)
            .map_err(|_| CoreError::InvalidArgument("malformed page token".to_string())),
    }
}

fn paginate(
    mut rows: Vec<WorkflowExecutionRecord>,
    request: &ListExecutionsRequest,
) -> Result<ListExecutionsResponse> {
    rows.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    let offset = decode_page_token(&request.next_page_token)?;
    let page: Vec<_> = rows.iter().skip(offset).take(request.page_size).cloned().collect();
    let consumed = offset + page.len();
    let next_page_token = if consumed < rows.len() {
        Some(serde_json::to_vec(&consumed)?)
    } else {
        None
    };
    Ok(ListExecutionsResponse {
        executions: page,
        next_page_token,
    })
}

#[async_trait]
impl VisibilityStore for MemoryStore {
    async fn record_workflow_execution_started(
        &self,
        request: RecordExecutionStartedRequest,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .open_executions
            .entry(request.domain_id)
            .or_default()
            .push(WorkflowExecutionRecord {
                execution: request.execution,
                workflow_type: request.workflow_type,
                start_time: request.start_time,
                close_time: None,
                status: None,
            });
        Ok(())
    }

    async fn record_workflow_execution_closed(
        &self,
        request: RecordExecutionClosedRequest,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(open) = inner.open_executions.get_mut(&request.domain_id) {
            open.retain(|record| record.execution != request.execution);
        }
        let retention = request
            .retention_seconds
            .unwrap_or(DEFAULT_CLOSE_TTL_SECONDS);
        inner
            .closed_executions
            .entry(request.domain_id)
            .or_default()
            .push(ClosedRecord {
                record: WorkflowExecutionRecord {
                    execution: request.execution,
                    workflow_type: request.workflow_type,
                    start_time: request.start_time,
                    close_time: Some(request.close_time),
                    status: Some(request.status),
                },
                expiry: request.close_time + Duration::seconds(retention),
            });
        Ok(())
    }

    async fn list_open_workflow_executions(
        &self,
        request: ListExecutionsRequest,
    ) -> Result<ListExecutionsResponse> {
        let inner = self.inner.lock().await;
        let rows: Vec<_> = inner
            .open_executions
            .get(&request.domain_id)
            .map(|rows| {
                rows.iter()
                    .filter(|record| {
                        record.start_time >= request.earliest_start_time
                            && record.start_time <= request.latest_start_time
                            && matches_filter(record, &request.filter)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(inner);
        paginate(rows, &request)
    }

    async fn list_closed_workflow_executions(
        &self,
        request: ListExecutionsRequest,
    ) -> Result<ListExecutionsResponse> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        let rows: Vec<_> = inner
            .closed_executions
            .get(&request.domain_id)
            .map(|rows| {
                rows.iter()
                    .filter(|closed| closed.expiry > now)
                    .map(|closed| &closed.record)
                    .filter(|record| {
                        record.start_time >= request.earliest_start_time
                            && record.start_time <= request.latest_start_time
                            && matches_filter(record, &request.filter)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(inner);
        paginate(rows, &request)
    }
}
