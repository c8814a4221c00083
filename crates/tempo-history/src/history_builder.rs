// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Append-only builder for a workflow's event history.
//!
//! Events receive monotone ids starting at 1 and are never mutated or
//! deleted. `serialize` produces the opaque blob stored on the execution row;
//! `load_execution_info` reconstructs the in-memory form from it.

use chrono::Utc;

use tempo_core::error::Result;
use tempo_core::events::{EventAttributes, EventType, HistoryEvent};
use tempo_core::persistence::WorkflowExecutionInfo;
use tempo_core::types::{FIRST_EVENT_ID, TimeoutType, WorkflowExecution};

/// Builds and queries one workflow's serialized history.
#[derive(Debug, Default)]
pub struct HistoryBuilder {
    events: Vec<HistoryEvent>,
    next_event_id: i64,
}

impl HistoryBuilder {
    /// An empty history; the first appended event gets id 1.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            next_event_id: FIRST_EVENT_ID,
        }
    }

    /// Reconstruct a builder from an execution row's history blob.
    pub fn load_execution_info(info: &WorkflowExecutionInfo) -> Result<Self> {
        let events: Vec<HistoryEvent> = serde_json::from_slice(&info.history)?;
        let next_event_id = events
            .last()
            .map(|event| event.event_id + 1)
            .unwrap_or(FIRST_EVENT_ID);
        Ok(Self {
            events,
            next_event_id,
        })
    }

    /// Serialize the history into the opaque execution-row blob.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.events)?)
    }

    /// Id the next appended event will receive.
    pub fn next_event_id(&self) -> i64 {
        self.next_event_id
    }

    /// All events in append order.
    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    /// Look up an event by id.
    pub fn get_event(&self, event_id: i64) -> Option<&HistoryEvent> {
        self.events.iter().find(|event| event.event_id == event_id)
    }

    /// The last event appended, if any.
    pub fn last_event(&self) -> Option<&HistoryEvent> {
        self.events.last()
    }

    /// Whether an activity scheduled at `schedule_id` has not yet reached a
    /// terminal event.
    pub fn is_activity_task_running(&self, schedule_id: i64) -> bool {
        let mut scheduled = false;
        for event in &self.events {
            match &event.attributes {
                EventAttributes::ActivityTaskScheduled { .. } if event.event_id == schedule_id => {
                    scheduled = true;
                }
                EventAttributes::ActivityTaskCompleted { scheduled_event_id, .. }
                | EventAttributes::ActivityTaskFailed { scheduled_event_id, .. }
                | EventAttributes::ActivityTaskTimedOut { scheduled_event_id, .. }
                | EventAttributes::ActivityTaskCanceled { scheduled_event_id, .. }
                    if *scheduled_event_id == schedule_id =>
                {
                    return false;
                }
                _ => {}
            }
        }
        scheduled
    }

    /// Count events of one type; used by tests to assert firing effects.
    pub fn count_events_of_type(&self, event_type: EventType) -> usize {
        self.events
            .iter()
            .filter(|event| event.event_type() == event_type)
            .count()
    }

    fn add_event(&mut self, attributes: EventAttributes) -> HistoryEvent {
        let event = HistoryEvent {
            event_id: self.next_event_id,
            timestamp: Utc::now(),
            attributes,
        };
        self.next_event_id += 1;
        self.events.push(event.clone());
        event
    }

    /// Append the execution's first event.
    #[allow(clippy::too_many_arguments)]
    pub fn add_workflow_execution_started_event(
        &mut self,
        workflow_type: &str,
        task_list: &str,
        input: Option<Vec<u8>>,
        execution_start_to_close_timeout_seconds: i32,
        task_start_to_close_timeout_seconds: i32,
        identity: &str,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::WorkflowExecutionStarted {
            workflow_type: workflow_type.to_string(),
            task_list: task_list.to_string(),
            input,
            execution_start_to_close_timeout_seconds,
            task_start_to_close_timeout_seconds,
            identity: identity.to_string(),
        })
    }

    /// Append a DecisionTaskScheduled event.
    pub fn add_decision_task_scheduled_event(
        &mut self,
        task_list: &str,
        start_to_close_timeout_seconds: i32,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::DecisionTaskScheduled {
            task_list: task_list.to_string(),
            start_to_close_timeout_seconds,
        })
    }

    /// Append a DecisionTaskStarted event.
    pub fn add_decision_task_started_event(
        &mut self,
        scheduled_event_id: i64,
        request_id: &str,
        identity: &str,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::DecisionTaskStarted {
            scheduled_event_id,
            identity: identity.to_string(),
            request_id: request_id.to_string(),
        })
    }

    /// Append a DecisionTaskCompleted event.
    pub fn add_decision_task_completed_event(
        &mut self,
        scheduled_event_id: i64,
        started_event_id: i64,
        identity: &str,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::DecisionTaskCompleted {
            scheduled_event_id,
            started_event_id,
            identity: identity.to_string(),
        })
    }

    /// Append a DecisionTaskTimedOut event.
    pub fn add_decision_task_timed_out_event(
        &mut self,
        scheduled_event_id: i64,
        started_event_id: i64,
        timeout_type: TimeoutType,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::DecisionTaskTimedOut {
            scheduled_event_id,
            started_event_id,
            timeout_type,
        })
    }

    /// Append an ActivityTaskScheduled event.
    #[allow(clippy::too_many_arguments)]
    pub fn add_activity_task_scheduled_event(
        &mut self,
        decision_task_completed_event_id: i64,
        activity_id: &str,
        activity_type: &str,
        task_list: &str,
        input: Option<Vec<u8>>,
        schedule_to_close_timeout_seconds: i32,
        schedule_to_start_timeout_seconds: i32,
        start_to_close_timeout_seconds: i32,
        heartbeat_timeout_seconds: i32,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::ActivityTaskScheduled {
            activity_id: activity_id.to_string(),
            activity_type: activity_type.to_string(),
            task_list: task_list.to_string(),
            input,
            decision_task_completed_event_id,
            schedule_to_close_timeout_seconds,
            schedule_to_start_timeout_seconds,
            start_to_close_timeout_seconds,
            heartbeat_timeout_seconds,
        })
    }

    /// Append an ActivityTaskStarted event.
    pub fn add_activity_task_started_event(
        &mut self,
        scheduled_event_id: i64,
        request_id: &str,
        identity: &str,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::ActivityTaskStarted {
            scheduled_event_id,
            identity: identity.to_string(),
            request_id: request_id.to_string(),
        })
    }

    /// Append an ActivityTaskCompleted event.
    pub fn add_activity_task_completed_event(
        &mut self,
        scheduled_event_id: i64,
        started_event_id: i64,
        result: Option<Vec<u8>>,
        identity: &str,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::ActivityTaskCompleted {
            scheduled_event_id,
            started_event_id,
            result,
            identity: identity.to_string(),
        })
    }

    /// Append an ActivityTaskFailed event.
    pub fn add_activity_task_failed_event(
        &mut self,
        scheduled_event_id: i64,
        started_event_id: i64,
        reason: &str,
        details: Option<Vec<u8>>,
        identity: &str,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::ActivityTaskFailed {
            scheduled_event_id,
            started_event_id,
            reason: reason.to_string(),
            details,
            identity: identity.to_string(),
        })
    }

    /// Append an ActivityTaskTimedOut event.
    pub fn add_activity_task_timed_out_event(
        &mut self,
        scheduled_event_id: i64,
        started_event_id: i64,
        timeout_type: TimeoutType,
        details: Option<Vec<u8>>,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::ActivityTaskTimedOut {
            scheduled_event_id,
            started_event_id,
            timeout_type,
            details,
        })
    }

    /// Append an ActivityTaskCanceled event.
    pub fn add_activity_task_canceled_event(
        &mut self,
        scheduled_event_id: i64,
        started_event_id: i64,
        details: Option<Vec<u8>>,
        identity: &str,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::ActivityTaskCanceled {
            scheduled_event_id,
            started_event_id,
            details,
            identity: identity.to_string(),
        })
    }

    /// Append a TimerStarted event.
    pub fn add_timer_started_event(
        &mut self,
        decision_task_completed_event_id: i64,
        timer_id: &str,
        start_to_fire_timeout_seconds: i64,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::TimerStarted {
            timer_id: timer_id.to_string(),
            start_to_fire_timeout_seconds,
            decision_task_completed_event_id,
        })
    }

    /// Append a TimerFired event.
    pub fn add_timer_fired_event(&mut self, started_event_id: i64, timer_id: &str) -> HistoryEvent {
        self.add_event(EventAttributes::TimerFired {
            timer_id: timer_id.to_string(),
            started_event_id,
        })
    }

    /// Append a TimerCanceled event.
    pub fn add_timer_canceled_event(
        &mut self,
        started_event_id: i64,
        timer_id: &str,
        decision_task_completed_event_id: i64,
        identity: &str,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::TimerCanceled {
            timer_id: timer_id.to_string(),
            started_event_id,
            decision_task_completed_event_id,
            identity: identity.to_string(),
        })
    }

    /// Append the terminal WorkflowExecutionCompleted event.
    pub fn add_workflow_execution_completed_event(
        &mut self,
        decision_task_completed_event_id: i64,
        result: Option<Vec<u8>>,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::WorkflowExecutionCompleted {
            result,
            decision_task_completed_event_id,
        })
    }

    /// Append the terminal WorkflowExecutionFailed event.
    pub fn add_workflow_execution_failed_event(
        &mut self,
        decision_task_completed_event_id: i64,
        reason: &str,
        details: Option<Vec<u8>>,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::WorkflowExecutionFailed {
            reason: reason.to_string(),
            details,
            decision_task_completed_event_id,
        })
    }

    /// Append the terminal WorkflowExecutionTimedOut event.
    pub fn add_workflow_execution_timed_out_event(
        &mut self,
        timeout_type: TimeoutType,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::WorkflowExecutionTimedOut { timeout_type })
    }

    /// Append the terminal WorkflowExecutionTerminated event.
    pub fn add_workflow_execution_terminated_event(
        &mut self,
        reason: &str,
        details: Option<Vec<u8>>,
        identity: &str,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::WorkflowExecutionTerminated {
            reason: reason.to_string(),
            details,
            identity: identity.to_string(),
        })
    }

    /// Append a WorkflowExecutionCancelRequested event.
    pub fn add_workflow_execution_cancel_requested_event(
        &mut self,
        cause: &str,
        identity: &str,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::WorkflowExecutionCancelRequested {
            cause: cause.to_string(),
            identity: identity.to_string(),
        })
    }

    /// Append a WorkflowExecutionSignaled event.
    pub fn add_workflow_execution_signaled_event(
        &mut self,
        signal_name: &str,
        input: Option<Vec<u8>>,
        identity: &str,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::WorkflowExecutionSignaled {
            signal_name: signal_name.to_string(),
            input,
            identity: identity.to_string(),
        })
    }

    /// Append a ChildWorkflowExecutionCompleted event.
    pub fn add_child_workflow_execution_completed_event(
        &mut self,
        workflow_execution: WorkflowExecution,
        workflow_type: &str,
        initiated_event_id: i64,
        started_event_id: i64,
        result: Option<Vec<u8>>,
    ) -> HistoryEvent {
        self.add_event(EventAttributes::ChildWorkflowExecutionCompleted {
            workflow_execution,
            workflow_type: workflow_type.to_string(),
            initiated_event_id,
            started_event_id,
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_builder() -> HistoryBuilder {
        let mut builder = HistoryBuilder::new();
        builder.add_workflow_execution_started_event("order", "orders", None, 60, 10, "starter");
        builder
    }

    #[test]
    fn test_event_ids_are_monotone_from_one() {
        let mut builder = started_builder();
        let scheduled = builder.add_decision_task_scheduled_event("orders", 10);
        let started = builder.add_decision_task_started_event(scheduled.event_id, "req-1", "worker");
        assert_eq!(builder.events()[0].event_id, 1);
        assert_eq!(scheduled.event_id, 2);
        assert_eq!(started.event_id, 3);
        assert_eq!(builder.next_event_id(), 4);
    }

    #[test]
    fn test_serialize_round_trip_preserves_history() {
        let mut builder = started_builder();
        let scheduled = builder.add_decision_task_scheduled_event("orders", 10);
        builder.add_decision_task_started_event(scheduled.event_id, "req-1", "worker");

        let info = WorkflowExecutionInfo {
            domain_id: "d".to_string(),
            workflow_id: "w".to_string(),
            run_id: "r".to_string(),
            workflow_type: "order".to_string(),
            task_list: "orders".to_string(),
            history: builder.serialize().unwrap(),
            execution_start_to_close_timeout_seconds: 60,
            task_start_to_close_timeout_seconds: 10,
            state: tempo_core::types::WorkflowState::Running,
            close_status: None,
            next_event_id: builder.next_event_id(),
            last_processed_event_id: 0,
            start_time: Utc::now(),
            last_updated: Utc::now(),
            decision_pending: true,
        };
        let loaded = HistoryBuilder::load_execution_info(&info).unwrap();
        assert_eq!(loaded.next_event_id(), builder.next_event_id());
        assert_eq!(loaded.events(), builder.events());
        assert!(loaded.get_event(scheduled.event_id).is_some());
    }

    #[test]
    fn test_serialize_is_deterministic() {
        let mut builder = started_builder();
        builder.add_timer_started_event(2, "t1", 5);
        let first = builder.serialize().unwrap();
        let second = builder.serialize().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_activity_running_tracks_terminal_events() {
        let mut builder = started_builder();
        let scheduled = builder.add_activity_task_scheduled_event(
            1, "a1", "charge", "payments", None, 0, 0, 10, 0,
        );
        assert!(builder.is_activity_task_running(scheduled.event_id));

        let started = builder.add_activity_task_started_event(scheduled.event_id, "req", "worker");
        assert!(builder.is_activity_task_running(scheduled.event_id));

        builder.add_activity_task_completed_event(
            scheduled.event_id,
            started.event_id,
            None,
            "worker",
        );
        assert!(!builder.is_activity_task_running(scheduled.event_id));
    }

    #[test]
    fn test_unknown_activity_is_not_running() {
        let builder = started_builder();
        assert!(!builder.is_activity_task_running(42));
    }
}
