// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Core identifiers, enums, and the decision vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The first event id assigned in any workflow history.
pub const FIRST_EVENT_ID: i64 = 1;

/// Sentinel event id meaning "no event"; used for not-yet-started activities
/// and decisions. Real event ids start at [`FIRST_EVENT_ID`].
pub const EMPTY_EVENT_ID: i64 = 0;

/// A workflow execution key within a domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Caller-supplied workflow identifier, unique among open executions.
    pub workflow_id: String,
    /// Run identifier, unique per attempt of the workflow id.
    pub run_id: String,
}

impl fmt::Display for WorkflowExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

/// Lifecycle state of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Row is being created; never observed by readers.
    Created,
    /// Execution is open and accepting events.
    Running,
    /// Execution reached a terminal event.
    Completed,
}

/// How a closed workflow execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowCloseStatus {
    /// Closed by a CompleteWorkflowExecution decision.
    Completed,
    /// Closed by a FailWorkflowExecution decision.
    Failed,
    /// Closed by an operator terminate request.
    Terminated,
    /// Closed by the workflow execution timeout firing.
    TimedOut,
}

/// The timeout dimension a timer task enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// From task start to task close.
    StartToClose,
    /// From schedule to task start.
    ScheduleToStart,
    /// From schedule to task close, regardless of start.
    ScheduleToClose,
    /// Between consecutive activity heartbeats.
    Heartbeat,
}

/// Kind of a durable timer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerTaskType {
    /// A workflow-requested timer (StartTimer decision).
    UserTimer,
    /// A decision task timeout.
    DecisionTimeout,
    /// An activity task timeout.
    ActivityTimeout,
    /// The whole-execution timeout.
    WorkflowTimeout,
}

/// Kind of a transfer task handed to the matching service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferTaskType {
    /// Dispatch a decision task to a decision task list.
    DecisionTask,
    /// Dispatch an activity task to an activity task list.
    ActivityTask,
}

/// Which worker population a task list serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskListType {
    /// Decision (workflow) task list.
    Decision,
    /// Activity task list.
    Activity,
}

impl TaskListType {
    /// Short label used in logs and storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskListType::Decision => "decision",
            TaskListType::Activity => "activity",
        }
    }
}

/// Key of a task list: one queue per `(domain, name, type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskListId {
    /// Owning domain.
    pub domain_id: String,
    /// Task list name.
    pub name: String,
    /// Decision or activity side of the list.
    pub task_type: TaskListType,
}

impl TaskListId {
    /// Create a task list key.
    pub fn new(domain_id: impl Into<String>, name: impl Into<String>, task_type: TaskListType) -> Self {
        Self {
            domain_id: domain_id.into(),
            name: name.into(),
            task_type,
        }
    }
}

impl fmt::Display for TaskListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain_id, self.name, self.task_type.as_str())
    }
}

/// A single command in a decision task completion.
///
/// This is the vocabulary a decision worker replies with; the history engine
/// turns each decision into events, mutable-state changes, and tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision_type", rename_all = "snake_case")]
pub enum Decision {
    /// Schedule an activity task on an activity task list.
    ScheduleActivityTask {
        /// Caller-chosen activity identifier, unique among pending activities.
        activity_id: String,
        /// Activity type name.
        activity_type: String,
        /// Activity task list to dispatch on.
        task_list: String,
        /// Opaque activity input.
        input: Option<Vec<u8>>,
        /// Overall schedule-to-close timeout in seconds (0 = none).
        schedule_to_close_timeout_seconds: i32,
        /// Schedule-to-start timeout in seconds (0 = none).
        schedule_to_start_timeout_seconds: i32,
        /// Start-to-close timeout in seconds (0 = none).
        start_to_close_timeout_seconds: i32,
        /// Heartbeat timeout in seconds (0 = none).
        heartbeat_timeout_seconds: i32,
    },
    /// Start a user timer.
    StartTimer {
        /// Caller-chosen timer identifier, unique among pending timers.
        timer_id: String,
        /// Seconds until the timer fires.
        start_to_fire_timeout_seconds: i64,
    },
    /// Cancel a pending user timer.
    CancelTimer {
        /// The timer to cancel.
        timer_id: String,
    },
    /// Complete the workflow execution successfully.
    CompleteWorkflowExecution {
        /// Opaque workflow result.
        result: Option<Vec<u8>>,
    },
    /// Fail the workflow execution.
    FailWorkflowExecution {
        /// Failure reason.
        reason: String,
        /// Opaque failure details.
        details: Option<Vec<u8>>,
    },
}
