//! Persistence interfaces and backends for tempo.
//!
//! This module defines the storage abstraction the history and matching
//! services are built on, plus two backends: [`SqliteStore`] (durable) and
//! [`MemoryStore`] (tests and embedded use).
//!
//! Every write that mutates ordered state carries a range lease (`range_id`);
//! the store rejects writes from stale owners. Workflow rows are mutated only
//! through a conditional update on `next_event_id`.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{
    TaskListId, TaskListType, TimeoutType, TimerTaskType, TransferTaskType, WorkflowCloseStatus,
    WorkflowExecution, WorkflowState,
};

/// Shard metadata: one row per history shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardInfo {
    /// Shard identifier.
    pub shard_id: i32,
    /// Range lease epoch; the holder is the shard's exclusive writer.
    pub range_id: i64,
    /// Highest transfer task id acknowledged by the transfer queue processor.
    pub transfer_ack_level: i64,
    /// Restart floor for the timer queue processor's index scan.
    pub timer_ack_level: DateTime<Utc>,
    /// Last time this row was written.
    pub updated_at: DateTime<Utc>,
}

/// A workflow execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionInfo {
    /// Owning domain.
    pub domain_id: String,
    /// Caller-supplied workflow id.
    pub workflow_id: String,
    /// Run id of this attempt.
    pub run_id: String,
    /// Workflow type name.
    pub workflow_type: String,
    /// Decision task list for this execution.
    pub task_list: String,
    /// Serialized history blob.
    pub history: Vec<u8>,
    /// Whole-execution timeout in seconds (0 = none).
    pub execution_start_to_close_timeout_seconds: i32,
    /// Per-decision-task timeout in seconds.
    pub task_start_to_close_timeout_seconds: i32,
    /// Lifecycle state.
    pub state: WorkflowState,
    /// How the execution closed, once `state` is Completed.
    pub close_status: Option<WorkflowCloseStatus>,
    /// Id the next appended event will receive; the conditional-update key.
    pub next_event_id: i64,
    /// Highest event id the workflow worker has processed.
    pub last_processed_event_id: i64,
    /// When the execution started.
    pub start_time: DateTime<Utc>,
    /// When the row was last written.
    pub last_updated: DateTime<Utc>,
    /// Whether a decision task is scheduled or started.
    pub decision_pending: bool,
}

/// Pending-activity projection entry, keyed by the schedule event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// The ActivityTaskScheduled event id.
    pub schedule_id: i64,
    /// The ActivityTaskStarted event id, or the empty sentinel until started.
    pub started_id: i64,
    /// Caller-chosen activity id.
    pub activity_id: String,
    /// Request id of the start, for redelivery dedup.
    pub request_id: String,
    /// Latest heartbeat details.
    pub details: Option<Vec<u8>>,
    /// Schedule-to-start timeout in seconds (0 = none).
    pub schedule_to_start_timeout: i32,
    /// Schedule-to-close timeout in seconds (0 = none).
    pub schedule_to_close_timeout: i32,
    /// Start-to-close timeout in seconds (0 = none).
    pub start_to_close_timeout: i32,
    /// Heartbeat timeout in seconds (0 = none).
    pub heartbeat_timeout: i32,
    /// Last time a heartbeat was recorded; start time until then.
    pub last_heartbeat: DateTime<Utc>,
    /// Whether a cancel has been requested for this activity.
    pub cancel_requested: bool,
}

/// Pending-timer projection entry, keyed by the user-supplied timer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerInfo {
    /// User-supplied timer id, unique within the workflow.
    pub timer_id: String,
    /// The TimerStarted event id.
    pub started_event_id: i64,
    /// When the timer is due.
    pub expiry_time: DateTime<Utc>,
    /// The durable timer task backing this timer.
    pub task_id: i64,
}

/// In-flight decision task state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInfo {
    /// The DecisionTaskScheduled event id.
    pub schedule_id: i64,
    /// The DecisionTaskStarted event id, or the empty sentinel until started.
    pub started_id: i64,
    /// Request id of the start, for redelivery dedup.
    pub request_id: String,
    /// Decision start-to-close timeout in seconds.
    pub start_to_close_timeout: i32,
}

/// A durable timer task row in the shard's timer index.
///
/// The index is ordered by `(visibility_time ASC, task_id ASC)`; each row
/// self-identifies its target workflow and task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerTaskInfo {
    /// Monotonic id within the shard.
    pub task_id: i64,
    /// Owning domain.
    pub domain_id: String,
    /// Target workflow id.
    pub workflow_id: String,
    /// Target run id.
    pub run_id: String,
    /// Kind of timer.
    pub task_type: TimerTaskType,
    /// Which timeout dimension this enforces.
    pub timeout_type: TimeoutType,
    /// The event the timeout refers to (schedule event, timer-started event).
    pub event_id: i64,
    /// Wall-clock instant the timer becomes due.
    pub visibility_time: DateTime<Utc>,
}

/// A transfer task row: a handoff record for the matching service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTaskInfo {
    /// Monotonic id within the shard.
    pub task_id: i64,
    /// Owning domain.
    pub domain_id: String,
    /// Source workflow id.
    pub workflow_id: String,
    /// Source run id.
    pub run_id: String,
    /// Decision or activity handoff.
    pub task_type: TransferTaskType,
    /// Target task list name.
    pub task_list: String,
    /// The schedule event the task refers to.
    pub schedule_id: i64,
    /// Schedule-to-start timeout carried to the matching task (0 = none).
    pub schedule_to_start_timeout_seconds: i32,
}

/// A matching task row, consumed by workers via long-poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Monotonic id within the task list.
    pub task_id: i64,
    /// Owning domain.
    pub domain_id: String,
    /// Source workflow id.
    pub workflow_id: String,
    /// Source run id.
    pub run_id: String,
    /// The schedule event the task refers to.
    pub schedule_id: i64,
    /// When the task stops being deliverable (None = never).
    pub expiry_time: Option<DateTime<Utc>>,
}

/// Task list metadata: lease and ack level for one `(domain, name, type)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskListInfo {
    /// Owning domain.
    pub domain_id: String,
    /// Task list name.
    pub name: String,
    /// Decision or activity side.
    pub task_type: TaskListType,
    /// Range lease epoch; the holder is the list's exclusive writer.
    pub range_id: i64,
    /// Highest contiguously-completed task id.
    pub ack_level: i64,
}

/// The denormalized per-workflow projection the timer processor validates
/// against.
#[derive(Debug, Clone, Default)]
pub struct WorkflowMutableState {
    /// Pending activities by schedule event id.
    pub activity_infos: HashMap<i64, ActivityInfo>,
    /// Pending user timers by timer id.
    pub timer_infos: HashMap<String, TimerInfo>,
    /// In-flight decision task, if any.
    pub decision: Option<DecisionInfo>,
    /// Id the next appended event will receive.
    pub next_event_id: i64,
    /// Lifecycle state.
    pub state: Option<WorkflowState>,
}

/// Request to atomically create a workflow execution with its first events
/// and tasks.
#[derive(Debug, Clone)]
pub struct CreateWorkflowExecutionRequest {
    /// Shard the execution hashes to.
    pub shard_id: i32,
    /// The creator's shard range lease.
    pub range_id: i64,
    /// The new execution row, including the serialized history.
    pub info: WorkflowExecutionInfo,
    /// Transfer tasks created with the execution.
    pub transfer_tasks: Vec<TransferTaskInfo>,
    /// Timer tasks created with the execution.
    pub timer_tasks: Vec<TimerTaskInfo>,
    /// The initial in-flight decision, if one was scheduled.
    pub decision: Option<DecisionInfo>,
}

/// Request to atomically update a workflow execution.
///
/// The write applies the new row, history blob, generated tasks, and staged
/// mutable-state changes in one conditional operation keyed on the stored
/// `next_event_id`.
#[derive(Debug, Clone, Default)]
pub struct UpdateWorkflowExecutionRequest {
    /// Shard the execution hashes to.
    pub shard_id: i32,
    /// The writer's shard range lease.
    pub range_id: i64,
    /// The updated execution row, including the new history blob.
    pub info: Option<WorkflowExecutionInfo>,
    /// Expected stored `next_event_id`; mismatch fails the write.
    pub condition: i64,
    /// Transfer tasks generated by this update.
    pub transfer_tasks: Vec<TransferTaskInfo>,
    /// Timer tasks generated by this update.
    pub timer_tasks: Vec<TimerTaskInfo>,
    /// Activity infos to insert or replace.
    pub upsert_activity_infos: Vec<ActivityInfo>,
    /// Schedule ids of activity infos to delete.
    pub delete_activity_infos: Vec<i64>,
    /// Timer infos to insert or replace.
    pub upsert_timer_infos: Vec<TimerInfo>,
    /// Timer ids of timer infos to delete.
    pub delete_timer_infos: Vec<String>,
    /// New in-flight decision, if one was scheduled or started.
    pub decision: Option<DecisionInfo>,
    /// Clear the in-flight decision (completion or timeout).
    pub clear_decision: bool,
}

impl UpdateWorkflowExecutionRequest {
    /// Whether this update stages no change at all.
    pub fn is_empty(&self) -> bool {
        self.info.is_none()
            && self.transfer_tasks.is_empty()
            && self.timer_tasks.is_empty()
            && self.upsert_activity_infos.is_empty()
            && self.delete_activity_infos.is_empty()
            && self.upsert_timer_infos.is_empty()
            && self.delete_timer_infos.is_empty()
            && self.decision.is_none()
            && !self.clear_decision
    }
}

/// Shard metadata operations.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Fetch the shard row, creating it with `range_id = 0` on first access.
    async fn get_or_create_shard(&self, shard_id: i32) -> Result<ShardInfo>;

    /// Write the shard row, conditional on the stored `range_id` equalling
    /// `previous_range_id`. Mismatch returns
    /// [`crate::CoreError::ShardOwnershipLost`].
    async fn update_shard(&self, shard: ShardInfo, previous_range_id: i64) -> Result<()>;
}

/// Workflow execution, timer index, and transfer queue operations.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Atomically create an execution with its history, tasks, and decision.
    ///
    /// Fails with [`crate::CoreError::ExecutionAlreadyStarted`] if the
    /// workflow id already has a running execution, and with
    /// [`crate::CoreError::ShardOwnershipLost`] if the carried `range_id` is
    /// stale.
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<()>;

    /// Fetch an execution row.
    async fn get_workflow_execution(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecutionInfo>;

    /// Fetch the denormalized mutable-state projection.
    async fn get_workflow_mutable_state(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowMutableState>;

    /// Atomically apply an update; conditional on the stored `next_event_id`
    /// and the shard `range_id`.
    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<()>;

    /// Scan the timer index: rows with `min_visibility ≤ visibility_time <
    /// max_visibility`, ordered by `(visibility_time, task_id)`, capped at
    /// `batch_size`.
    async fn get_timer_index_tasks(
        &self,
        shard_id: i32,
        min_visibility: DateTime<Utc>,
        max_visibility: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<TimerTaskInfo>>;

    /// Delete one timer index row.
    async fn complete_timer_task(
        &self,
        shard_id: i32,
        visibility_time: DateTime<Utc>,
        task_id: i64,
    ) -> Result<()>;

    /// Scan transfer tasks with `read_level < task_id ≤ max_read_level`,
    /// ordered by `task_id`, capped at `batch_size`.
    async fn get_transfer_tasks(
        &self,
        shard_id: i32,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TransferTaskInfo>>;

    /// Delete one transfer task row.
    async fn complete_transfer_task(&self, shard_id: i32, task_id: i64) -> Result<()>;
}

/// Matching task list operations.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Acquire the task list lease, creating the list on first use. The
    /// stored `range_id` is incremented; previous holders' writes are
    /// rejected from then on.
    async fn lease_task_list(&self, id: &TaskListId) -> Result<TaskListInfo>;

    /// Persist the task list row (ack level), conditional on the stored
    /// `range_id` equalling `info.range_id`.
    async fn update_task_list(&self, info: TaskListInfo) -> Result<()>;

    /// Append a batch of tasks, all-or-nothing, conditional on the carried
    /// `range_id` matching the stored lease. A mismatch fails with
    /// [`crate::CoreError::ConditionFailed`]; the caller re-reads its lease
    /// and retries.
    async fn create_tasks(
        &self,
        id: &TaskListId,
        tasks: Vec<TaskInfo>,
        range_id: i64,
    ) -> Result<()>;

    /// Scan tasks with `read_level < task_id ≤ max_read_level`, ordered by
    /// `task_id`, capped at `batch_size`.
    async fn get_tasks(
        &self,
        id: &TaskListId,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TaskInfo>>;

    /// Delete one task row after delivery.
    async fn complete_task(&self, id: &TaskListId, task_id: i64) -> Result<()>;
}

/// One row in a visibility listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionRecord {
    /// The execution.
    pub execution: WorkflowExecution,
    /// Workflow type name.
    pub workflow_type: String,
    /// When the execution started.
    pub start_time: DateTime<Utc>,
    /// When the execution closed (closed listings only).
    pub close_time: Option<DateTime<Utc>>,
    /// How the execution closed (closed listings only).
    pub status: Option<WorkflowCloseStatus>,
}

/// Request to record a started execution in the open-executions index.
#[derive(Debug, Clone)]
pub struct RecordExecutionStartedRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The execution.
    pub execution: WorkflowExecution,
    /// Workflow type name.
    pub workflow_type: String,
    /// When the execution started.
    pub start_time: DateTime<Utc>,
}

/// Request to move an execution from the open index to the closed index.
#[derive(Debug, Clone)]
pub struct RecordExecutionClosedRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The execution.
    pub execution: WorkflowExecution,
    /// Workflow type name.
    pub workflow_type: String,
    /// When the execution started.
    pub start_time: DateTime<Utc>,
    /// When the execution closed.
    pub close_time: DateTime<Utc>,
    /// How the execution closed.
    pub status: WorkflowCloseStatus,
    /// Row TTL in seconds; None applies the default retention (86400).
    pub retention_seconds: Option<i64>,
}

/// Optional filter on a visibility listing.
#[derive(Debug, Clone, PartialEq)]
pub enum VisibilityFilter {
    /// Only executions of this workflow type.
    WorkflowType(String),
    /// Only executions of this workflow id.
    WorkflowId(String),
    /// Only closed executions with this status (closed listings only).
    Status(WorkflowCloseStatus),
}

/// A paginated visibility listing request over a start-time window.
#[derive(Debug, Clone)]
pub struct ListExecutionsRequest {
    /// Owning domain.
    pub domain_id: String,
    /// Inclusive lower bound on start time.
    pub earliest_start_time: DateTime<Utc>,
    /// Inclusive upper bound on start time.
    pub latest_start_time: DateTime<Utc>,
    /// Maximum rows per page.
    pub page_size: usize,
    /// Opaque continuation token from a previous page.
    pub next_page_token: Option<Vec<u8>>,
    /// Optional filter.
    pub filter: Option<VisibilityFilter>,
}

/// One page of a visibility listing.
#[derive(Debug, Clone)]
pub struct ListExecutionsResponse {
    /// The rows, newest start time first.
    pub executions: Vec<WorkflowExecutionRecord>,
    /// Token for the next page; None when exhausted.
    pub next_page_token: Option<Vec<u8>>,
}

/// Visibility index operations: open/closed executions by time, type, id,
/// and status.
#[async_trait]
pub trait VisibilityStore: Send + Sync {
    /// Insert into the open-executions index.
    async fn record_workflow_execution_started(
        &self,
        request: RecordExecutionStartedRequest,
    ) -> Result<()>;

    /// Remove from the open index and insert into the closed index with TTL.
    async fn record_workflow_execution_closed(
        &self,
        request: RecordExecutionClosedRequest,
    ) -> Result<()>;

    /// List open executions in a start-time window.
    async fn list_open_workflow_executions(
        &self,
        request: ListExecutionsRequest,
    ) -> Result<ListExecutionsResponse>;

    /// List closed, unexpired executions in a start-time window.
    async fn list_closed_workflow_executions(
        &self,
        request: ListExecutionsRequest,
    ) -> Result<ListExecutionsResponse>;
}

/// Default TTL for closed-execution visibility rows, in seconds.
pub const DEFAULT_CLOSE_TTL_SECONDS: i64 = 86400;
