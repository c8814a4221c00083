// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staged-mutation builder over a workflow's mutable-state projection.
//!
//! The builder is not a live mirror: it loads one snapshot, answers the
//! queries the processors need, and accumulates a batch of changes that
//! commit (or are discarded) in exactly one conditional update. A builder is
//! never reused across retry attempts.

use std::collections::HashMap;

use tempo_core::persistence::{
    ActivityInfo, DecisionInfo, TimerInfo, UpdateWorkflowExecutionRequest, WorkflowMutableState,
};
use tempo_core::types::{EMPTY_EVENT_ID, WorkflowState};

/// Builds one batch of mutable-state changes.
#[derive(Debug, Default)]
pub struct MutableStateBuilder {
    pending_activities: HashMap<i64, ActivityInfo>,
    pending_timers: HashMap<String, TimerInfo>,
    decision: Option<DecisionInfo>,
    state: Option<WorkflowState>,

    update_activity_infos: Vec<ActivityInfo>,
    delete_activity_infos: Vec<i64>,
    update_timer_infos: Vec<TimerInfo>,
    delete_timer_infos: Vec<String>,
    staged_decision: Option<DecisionInfo>,
    clear_decision: bool,
}

impl MutableStateBuilder {
    /// An empty builder with nothing loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot of the stored projection.
    pub fn load(&mut self, state: WorkflowMutableState) {
        self.pending_activities = state.activity_infos;
        self.pending_timers = state.timer_infos;
        self.decision = state.decision;
        self.state = state.state;
    }

    /// The loaded lifecycle state, if any.
    pub fn workflow_state(&self) -> Option<WorkflowState> {
        self.state
    }

    /// Pending activity by its schedule event id.
    pub fn get_activity(&self, schedule_id: i64) -> Option<&ActivityInfo> {
        self.pending_activities.get(&schedule_id)
    }

    /// All pending activities, in no particular order.
    pub fn pending_activities(&self) -> impl Iterator<Item = &ActivityInfo> {
        self.pending_activities.values()
    }

    /// Whether an activity is pending, regardless of start state.
    pub fn is_activity_running(&self, schedule_id: i64) -> bool {
        self.pending_activities.contains_key(&schedule_id)
    }

    /// Whether an activity is pending and has been started.
    pub fn is_activity_started(&self, schedule_id: i64) -> bool {
        self.pending_activities
            .get(&schedule_id)
            .map(|activity| activity.started_id != EMPTY_EVENT_ID)
            .unwrap_or(false)
    }

    /// Pending user timer by its timer id.
    pub fn get_user_timer(&self, timer_id: &str) -> Option<&TimerInfo> {
        self.pending_timers.get(timer_id)
    }

    /// Pending user timer backed by a given durable timer task.
    pub fn get_user_timer_by_task_id(&self, task_id: i64) -> Option<&TimerInfo> {
        self.pending_timers
            .values()
            .find(|timer| timer.task_id == task_id)
    }

    /// The in-flight decision, if any.
    pub fn get_decision(&self) -> Option<&DecisionInfo> {
        self.decision.as_ref()
    }

    /// Stage an activity insert or replacement.
    pub fn update_activity(&mut self, activity: ActivityInfo) {
        self.pending_activities
            .insert(activity.schedule_id, activity.clone());
        self.update_activity_infos
            .retain(|staged| staged.schedule_id != activity.schedule_id);
        self.update_activity_infos.push(activity);
    }

    /// Stage an activity deletion.
    pub fn delete_activity(&mut self, schedule_id: i64) {
        self.pending_activities.remove(&schedule_id);
        self.update_activity_infos
            .retain(|staged| staged.schedule_id != schedule_id);
        self.delete_activity_infos.push(schedule_id);
    }

    /// Stage a user timer insert or replacement.
    pub fn update_user_timer(&mut self, timer: TimerInfo) {
        self.pending_timers
            .insert(timer.timer_id.clone(), timer.clone());
        self.update_timer_infos
            .retain(|staged| staged.timer_id != timer.timer_id);
        self.update_timer_infos.push(timer);
    }

    /// Stage a user timer deletion.
    pub fn delete_user_timer(&mut self, timer_id: &str) {
        self.pending_timers.remove(timer_id);
        self.update_timer_infos
            .retain(|staged| staged.timer_id != timer_id);
        self.delete_timer_infos.push(timer_id.to_string());
    }

    /// Stage the in-flight decision.
    pub fn set_decision(&mut self, decision: DecisionInfo) {
        self.decision = Some(decision.clone());
        self.staged_decision = Some(decision);
        self.clear_decision = false;
    }

    /// Stage clearing the in-flight decision.
    pub fn clear_decision(&mut self) {
        self.decision = None;
        self.staged_decision = None;
        self.clear_decision = true;
    }

    /// Move every staged change into a store update, consuming the builder
    /// so it cannot be reused for another attempt.
    pub fn stage(self, request: &mut UpdateWorkflowExecutionRequest) {
        request.upsert_activity_infos = self.update_activity_infos;
        request.delete_activity_infos = self.delete_activity_infos;
        request.upsert_timer_infos = self.update_timer_infos;
        request.delete_timer_infos = self.delete_timer_infos;
        request.decision = self.staged_decision;
        request.clear_decision = self.clear_decision;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn activity(schedule_id: i64, started_id: i64) -> ActivityInfo {
        ActivityInfo {
            schedule_id,
            started_id,
            activity_id: format!("a{schedule_id}"),
            request_id: String::new(),
            details: None,
            schedule_to_start_timeout: 0,
            schedule_to_close_timeout: 0,
            start_to_close_timeout: 10,
            heartbeat_timeout: 0,
            last_heartbeat: Utc::now(),
            cancel_requested: false,
        }
    }

    fn timer(timer_id: &str, task_id: i64) -> TimerInfo {
        TimerInfo {
            timer_id: timer_id.to_string(),
            started_event_id: 4,
            expiry_time: Utc::now(),
            task_id,
        }
    }

    #[test]
    fn test_activity_queries_reflect_staged_changes() {
        let mut builder = MutableStateBuilder::new();
        assert!(!builder.is_activity_running(5));

        builder.update_activity(activity(5, EMPTY_EVENT_ID));
        assert!(builder.is_activity_running(5));
        assert!(!builder.is_activity_started(5));

        builder.update_activity(activity(5, 6));
        assert!(builder.is_activity_started(5));

        builder.delete_activity(5);
        assert!(!builder.is_activity_running(5));
    }

    #[test]
    fn test_stage_collapses_update_then_delete() {
        let mut builder = MutableStateBuilder::new();
        builder.update_activity(activity(5, EMPTY_EVENT_ID));
        builder.delete_activity(5);
        builder.update_user_timer(timer("t1", 100));
        builder.delete_user_timer("t1");

        let mut request = UpdateWorkflowExecutionRequest::default();
        builder.stage(&mut request);
        assert!(request.upsert_activity_infos.is_empty());
        assert_eq!(request.delete_activity_infos, vec![5]);
        assert!(request.upsert_timer_infos.is_empty());
        assert_eq!(request.delete_timer_infos, vec!["t1".to_string()]);
    }

    #[test]
    fn test_timer_lookup_by_task_id() {
        let mut builder = MutableStateBuilder::new();
        builder.update_user_timer(timer("t1", 100));
        builder.update_user_timer(timer("t2", 101));

        assert_eq!(
            builder.get_user_timer_by_task_id(101).map(|t| t.timer_id.as_str()),
            Some("t2")
        );
        assert!(builder.get_user_timer_by_task_id(999).is_none());
    }

    #[test]
    fn test_decision_staging() {
        let mut builder = MutableStateBuilder::new();
        builder.set_decision(DecisionInfo {
            schedule_id: 2,
            started_id: EMPTY_EVENT_ID,
            request_id: String::new(),
            start_to_close_timeout: 10,
        });
        assert_eq!(builder.get_decision().map(|d| d.schedule_id), Some(2));

        builder.clear_decision();
        assert!(builder.get_decision().is_none());

        let mut request = UpdateWorkflowExecutionRequest::default();
        builder.stage(&mut request);
        assert!(request.decision.is_none());
        assert!(request.clear_decision);
    }
}
