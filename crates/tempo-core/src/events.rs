// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow history events.
//!
//! A workflow's history is an append-only sequence of [`HistoryEvent`]s with
//! monotone event ids starting at 1. The whole history is serialized as one
//! opaque blob per execution update; no event is ever mutated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{TimeoutType, WorkflowExecution};

/// One entry in a workflow's event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Monotone id, starting at [`crate::types::FIRST_EVENT_ID`].
    pub event_id: i64,
    /// When the event was appended.
    pub timestamp: DateTime<Utc>,
    /// Type-specific attributes.
    #[serde(flatten)]
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// The event's type tag.
    pub fn event_type(&self) -> EventType {
        self.attributes.event_type()
    }
}

/// Discriminant of a history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionTimedOut,
    WorkflowExecutionTerminated,
    WorkflowExecutionCancelRequested,
    WorkflowExecutionSignaled,
    DecisionTaskScheduled,
    DecisionTaskStarted,
    DecisionTaskCompleted,
    DecisionTaskTimedOut,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    ActivityTaskTimedOut,
    ActivityTaskCanceled,
    TimerStarted,
    TimerFired,
    TimerCanceled,
    ChildWorkflowExecutionCompleted,
}

/// Typed attributes for each event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventAttributes {
    /// The execution's first event.
    WorkflowExecutionStarted {
        /// Workflow type name.
        workflow_type: String,
        /// Decision task list for this execution.
        task_list: String,
        /// Opaque workflow input.
        input: Option<Vec<u8>>,
        /// Whole-execution timeout in seconds (0 = none).
        execution_start_to_close_timeout_seconds: i32,
        /// Per-decision-task timeout in seconds.
        task_start_to_close_timeout_seconds: i32,
        /// Identity of the starter.
        identity: String,
    },
    /// Terminal event: completed by decision.
    WorkflowExecutionCompleted {
        /// Opaque workflow result.
        result: Option<Vec<u8>>,
        /// The decision completion that produced this event.
        decision_task_completed_event_id: i64,
    },
    /// Terminal event: failed by decision.
    WorkflowExecutionFailed {
        /// Failure reason.
        reason: String,
        /// Opaque failure details.
        details: Option<Vec<u8>>,
        /// The decision completion that produced this event.
        decision_task_completed_event_id: i64,
    },
    /// Terminal event: the execution timeout fired.
    WorkflowExecutionTimedOut {
        /// Which timeout dimension fired.
        timeout_type: TimeoutType,
    },
    /// Terminal event: terminated by an operator.
    WorkflowExecutionTerminated {
        /// Termination reason.
        reason: String,
        /// Opaque details.
        details: Option<Vec<u8>>,
        /// Identity of the terminator.
        identity: String,
    },
    /// A cancel was requested for the execution.
    WorkflowExecutionCancelRequested {
        /// Why the cancel was requested.
        cause: String,
        /// Identity of the requester.
        identity: String,
    },
    /// An external signal was delivered to the execution.
    WorkflowExecutionSignaled {
        /// Signal name.
        signal_name: String,
        /// Opaque signal payload.
        input: Option<Vec<u8>>,
        /// Identity of the sender.
        identity: String,
    },
    /// A decision task was scheduled.
    DecisionTaskScheduled {
        /// Decision task list.
        task_list: String,
        /// Decision start-to-close timeout in seconds.
        start_to_close_timeout_seconds: i32,
    },
    /// A decision task was claimed by a worker.
    DecisionTaskStarted {
        /// The matching DecisionTaskScheduled event.
        scheduled_event_id: i64,
        /// Worker identity.
        identity: String,
        /// Poll request id, for dedup of redeliveries.
        request_id: String,
    },
    /// A decision task completed with a batch of decisions.
    DecisionTaskCompleted {
        /// The matching DecisionTaskScheduled event.
        scheduled_event_id: i64,
        /// The matching DecisionTaskStarted event.
        started_event_id: i64,
        /// Worker identity.
        identity: String,
    },
    /// A decision task timed out; a new attempt is scheduled.
    DecisionTaskTimedOut {
        /// The matching DecisionTaskScheduled event.
        scheduled_event_id: i64,
        /// The matching DecisionTaskStarted event, or the empty sentinel.
        started_event_id: i64,
        /// Which timeout dimension fired.
        timeout_type: TimeoutType,
    },
    /// An activity task was scheduled.
    ActivityTaskScheduled {
        /// Caller-chosen activity id.
        activity_id: String,
        /// Activity type name.
        activity_type: String,
        /// Activity task list.
        task_list: String,
        /// Opaque activity input.
        input: Option<Vec<u8>>,
        /// The decision completion that produced this event.
        decision_task_completed_event_id: i64,
        /// Schedule-to-close timeout in seconds (0 = none).
        schedule_to_close_timeout_seconds: i32,
        /// Schedule-to-start timeout in seconds (0 = none).
        schedule_to_start_timeout_seconds: i32,
        /// Start-to-close timeout in seconds (0 = none).
        start_to_close_timeout_seconds: i32,
        /// Heartbeat timeout in seconds (0 = none).
        heartbeat_timeout_seconds: i32,
    },
    /// An activity task was claimed by a worker.
    ActivityTaskStarted {
        /// The matching ActivityTaskScheduled event.
        scheduled_event_id: i64,
        /// Worker identity.
        identity: String,
        /// Poll request id, for dedup of redeliveries.
        request_id: String,
    },
    /// An activity task completed.
    ActivityTaskCompleted {
        /// The matching ActivityTaskScheduled event.
        scheduled_event_id: i64,
        /// The matching ActivityTaskStarted event.
        started_event_id: i64,
        /// Opaque activity result.
        result: Option<Vec<u8>>,
        /// Worker identity.
        identity: String,
    },
    /// An activity task failed.
    ActivityTaskFailed {
        /// The matching ActivityTaskScheduled event.
        scheduled_event_id: i64,
        /// The matching ActivityTaskStarted event.
        started_event_id: i64,
        /// Failure reason.
        reason: String,
        /// Opaque failure details.
        details: Option<Vec<u8>>,
        /// Worker identity.
        identity: String,
    },
    /// An activity task timed out.
    ActivityTaskTimedOut {
        /// The matching ActivityTaskScheduled event.
        scheduled_event_id: i64,
        /// The matching ActivityTaskStarted event, or the empty sentinel.
        started_event_id: i64,
        /// Which timeout dimension fired.
        timeout_type: TimeoutType,
        /// Last heartbeat details, if any.
        details: Option<Vec<u8>>,
    },
    /// An activity task acknowledged a cancel request.
    ActivityTaskCanceled {
        /// The matching ActivityTaskScheduled event.
        scheduled_event_id: i64,
        /// The matching ActivityTaskStarted event.
        started_event_id: i64,
        /// Opaque cancellation details.
        details: Option<Vec<u8>>,
        /// Worker identity.
        identity: String,
    },
    /// A user timer was started.
    TimerStarted {
        /// Caller-chosen timer id.
        timer_id: String,
        /// Seconds until the timer fires.
        start_to_fire_timeout_seconds: i64,
        /// The decision completion that produced this event.
        decision_task_completed_event_id: i64,
    },
    /// A user timer fired.
    TimerFired {
        /// The timer that fired.
        timer_id: String,
        /// The matching TimerStarted event.
        started_event_id: i64,
    },
    /// A user timer was cancelled before firing.
    TimerCanceled {
        /// The timer that was cancelled.
        timer_id: String,
        /// The matching TimerStarted event.
        started_event_id: i64,
        /// The decision completion that produced this event.
        decision_task_completed_event_id: i64,
        /// Worker identity.
        identity: String,
    },
    /// A child workflow execution reported completion to its parent.
    ChildWorkflowExecutionCompleted {
        /// The child execution.
        workflow_execution: WorkflowExecution,
        /// Child workflow type name.
        workflow_type: String,
        /// The parent-side initiation event.
        initiated_event_id: i64,
        /// The child-side started event.
        started_event_id: i64,
        /// Opaque child result.
        result: Option<Vec<u8>>,
    },
}

impl EventAttributes {
    /// The discriminant for this set of attributes.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::WorkflowExecutionStarted { .. } => EventType::WorkflowExecutionStarted,
            Self::WorkflowExecutionCompleted { .. } => EventType::WorkflowExecutionCompleted,
            Self::WorkflowExecutionFailed { .. } => EventType::WorkflowExecutionFailed,
            Self::WorkflowExecutionTimedOut { .. } => EventType::WorkflowExecutionTimedOut,
            Self::WorkflowExecutionTerminated { .. } => EventType::WorkflowExecutionTerminated,
            Self::WorkflowExecutionCancelRequested { .. } => {
                EventType::WorkflowExecutionCancelRequested
            }
            Self::WorkflowExecutionSignaled { .. } => EventType::WorkflowExecutionSignaled,
            Self::DecisionTaskScheduled { .. } => EventType::DecisionTaskScheduled,
            Self::DecisionTaskStarted { .. } => EventType::DecisionTaskStarted,
            Self::DecisionTaskCompleted { .. } => EventType::DecisionTaskCompleted,
            Self::DecisionTaskTimedOut { .. } => EventType::DecisionTaskTimedOut,
            Self::ActivityTaskScheduled { .. } => EventType::ActivityTaskScheduled,
            Self::ActivityTaskStarted { .. } => EventType::ActivityTaskStarted,
            Self::ActivityTaskCompleted { .. } => EventType::ActivityTaskCompleted,
            Self::ActivityTaskFailed { .. } => EventType::ActivityTaskFailed,
            Self::ActivityTaskTimedOut { .. } => EventType::ActivityTaskTimedOut,
            Self::ActivityTaskCanceled { .. } => EventType::ActivityTaskCanceled,
            Self::TimerStarted { .. } => EventType::TimerStarted,
            Self::TimerFired { .. } => EventType::TimerFired,
            Self::TimerCanceled { .. } => EventType::TimerCanceled,
            Self::ChildWorkflowExecutionCompleted { .. } => {
                EventType::ChildWorkflowExecutionCompleted
            }
        }
    }
}
