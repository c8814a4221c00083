// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Derives durable timer tasks from just-emitted events and mutable state.
//!
//! Every timeout dimension that applies gets its own task; the timer queue
//! processor fires the earliest one that is still valid. `visibility_time`
//! is `now + timeout`. Ties between identical expiries are broken by the
//! task id, which comes from a monotonic sequence generator: the shard in
//! production paths, a local counter in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use tempo_core::error::{CoreError, Result};
use tempo_core::persistence::{TimerInfo, TimerTaskInfo};
use tempo_core::types::{TimeoutType, TimerTaskType, WorkflowExecution};

use crate::mutable_state::MutableStateBuilder;

/// Source of monotonic timer task ids.
#[async_trait]
pub trait SequenceNumberGenerator: Send + Sync {
    /// Allocate the next sequence number.
    async fn next_sequence_number(&self) -> Result<i64>;
}

/// A process-local sequence generator; tie-breaking only, no durability.
pub struct LocalSequenceNumberGenerator {
    counter: AtomicI64,
}

impl LocalSequenceNumberGenerator {
    /// Start counting at `start`.
    pub fn new(start: i64) -> Self {
        Self {
            counter: AtomicI64::new(start),
        }
    }
}

#[async_trait]
impl SequenceNumberGenerator for LocalSequenceNumberGenerator {
    async fn next_sequence_number(&self) -> Result<i64> {
        Ok(self.counter.fetch_add(1, Ordering::Relaxed))
    }
}

/// A timer task before it is bound to a workflow execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerTask {
    /// Monotonic id; the timer's durable identity.
    pub task_id: i64,
    /// Kind of timer.
    pub task_type: TimerTaskType,
    /// Which timeout dimension this enforces.
    pub timeout_type: TimeoutType,
    /// The event the timeout refers to.
    pub event_id: i64,
    /// When the timer becomes due.
    pub visibility_time: DateTime<Utc>,
}

impl TimerTask {
    /// Bind the task to its workflow for persistence.
    pub fn into_info(self, domain_id: &str, execution: &WorkflowExecution) -> TimerTaskInfo {
        TimerTaskInfo {
            task_id: self.task_id,
            domain_id: domain_id.to_string(),
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id.clone(),
            task_type: self.task_type,
            timeout_type: self.timeout_type,
            event_id: self.event_id,
            visibility_time: self.visibility_time,
        }
    }
}

/// Builds timer tasks for activity, decision, user, and workflow timeouts.
pub struct TimerBuilder {
    sequence: Arc<dyn SequenceNumberGenerator>,
}

impl TimerBuilder {
    /// Create a builder over a sequence generator.
    pub fn new(sequence: Arc<dyn SequenceNumberGenerator>) -> Self {
        Self { sequence }
    }

    async fn new_task(
        &self,
        task_type: TimerTaskType,
        timeout_type: TimeoutType,
        event_id: i64,
        fire_in_seconds: i64,
    ) -> Result<TimerTask> {
        Ok(TimerTask {
            task_id: self.sequence.next_sequence_number().await?,
            task_type,
            timeout_type,
            event_id,
            visibility_time: Utc::now() + Duration::seconds(fire_in_seconds),
        })
    }

    /// Schedule-to-start timeout for an activity just scheduled. Returns
    /// None when the activity carries no such timeout.
    pub async fn add_schedule_to_start_activity_timeout(
        &self,
        schedule_id: i64,
        mutable_state: &MutableStateBuilder,
    ) -> Result<Option<TimerTask>> {
        self.activity_timeout(
            schedule_id,
            mutable_state,
            TimeoutType::ScheduleToStart,
            |activity| activity.schedule_to_start_timeout,
        )
        .await
    }

    /// Schedule-to-close timeout for an activity, regardless of start state.
    pub async fn add_schedule_to_close_activity_timeout(
        &self,
        schedule_id: i64,
        mutable_state: &MutableStateBuilder,
    ) -> Result<Option<TimerTask>> {
        self.activity_timeout(
            schedule_id,
            mutable_state,
            TimeoutType::ScheduleToClose,
            |activity| activity.schedule_to_close_timeout,
        )
        .await
    }

    /// Start-to-close timeout for an activity that just started.
    pub async fn add_start_to_close_activity_timeout(
        &self,
        schedule_id: i64,
        mutable_state: &MutableStateBuilder,
    ) -> Result<Option<TimerTask>> {
        self.activity_timeout(
            schedule_id,
            mutable_state,
            TimeoutType::StartToClose,
            |activity| activity.start_to_close_timeout,
        )
        .await
    }

    /// Heartbeat timeout for a started activity.
    pub async fn add_heart_beat_activity_timeout(
        &self,
        schedule_id: i64,
        mutable_state: &MutableStateBuilder,
    ) -> Result<Option<TimerTask>> {
        self.activity_timeout(
            schedule_id,
            mutable_state,
            TimeoutType::Heartbeat,
            |activity| activity.heartbeat_timeout,
        )
        .await
    }

    async fn activity_timeout(
        &self,
        schedule_id: i64,
        mutable_state: &MutableStateBuilder,
        timeout_type: TimeoutType,
        timeout_of: impl Fn(&tempo_core::persistence::ActivityInfo) -> i32 + Send,
    ) -> Result<Option<TimerTask>> {
        let activity = mutable_state.get_activity(schedule_id).ok_or_else(|| {
            CoreError::NotFound(format!("pending activity with schedule id {schedule_id}"))
        })?;
        let timeout = timeout_of(activity);
        if timeout <= 0 {
            return Ok(None);
        }
        let task = self
            .new_task(
                TimerTaskType::ActivityTimeout,
                timeout_type,
                schedule_id,
                timeout as i64,
            )
            .await?;
        Ok(Some(task))
    }

    /// User timer: stages the `TimerInfo` that pairs with the task, keyed by
    /// the task id, and returns the task.
    pub async fn add_user_timer(
        &self,
        timer_id: &str,
        fire_in_seconds: i64,
        started_event_id: i64,
        mutable_state: &mut MutableStateBuilder,
    ) -> Result<TimerTask> {
        let task = self
            .create_user_timer_task(fire_in_seconds, started_event_id)
            .await?;
        mutable_state.update_user_timer(TimerInfo {
            timer_id: timer_id.to_string(),
            started_event_id,
            expiry_time: task.visibility_time,
            task_id: task.task_id,
        });
        Ok(task)
    }

    /// A bare user-timer task; callers stage the matching `TimerInfo`.
    pub async fn create_user_timer_task(
        &self,
        fire_in_seconds: i64,
        started_event_id: i64,
    ) -> Result<TimerTask> {
        self.new_task(
            TimerTaskType::UserTimer,
            TimeoutType::StartToClose,
            started_event_id,
            fire_in_seconds,
        )
        .await
    }

    /// Start-to-close timeout for a decision task that just started.
    pub async fn create_decision_timeout_task(
        &self,
        start_to_close_seconds: i32,
        scheduled_event_id: i64,
    ) -> Result<TimerTask> {
        self.new_task(
            TimerTaskType::DecisionTimeout,
            TimeoutType::StartToClose,
            scheduled_event_id,
            start_to_close_seconds as i64,
        )
        .await
    }

    /// Whole-execution timeout, created with the execution.
    pub async fn create_workflow_timeout_task(&self, timeout_seconds: i32) -> Result<TimerTask> {
        self.new_task(
            TimerTaskType::WorkflowTimeout,
            TimeoutType::StartToClose,
            0,
            timeout_seconds as i64,
        )
        .await
    }

    /// Re-arm a heartbeat timer relative to the last recorded heartbeat.
    pub async fn create_heartbeat_rearm_task(
        &self,
        schedule_id: i64,
        last_heartbeat: DateTime<Utc>,
        heartbeat_timeout_seconds: i32,
    ) -> Result<TimerTask> {
        Ok(TimerTask {
            task_id: self.sequence.next_sequence_number().await?,
            task_type: TimerTaskType::ActivityTimeout,
            timeout_type: TimeoutType::Heartbeat,
            event_id: schedule_id,
            visibility_time: last_heartbeat + Duration::seconds(heartbeat_timeout_seconds as i64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_core::persistence::ActivityInfo;
    use tempo_core::types::EMPTY_EVENT_ID;

    fn builder() -> TimerBuilder {
        TimerBuilder::new(Arc::new(LocalSequenceNumberGenerator::new(1)))
    }

    fn staged_activity(
        mutable_state: &mut MutableStateBuilder,
        schedule_id: i64,
        schedule_to_start: i32,
        start_to_close: i32,
    ) {
        mutable_state.update_activity(ActivityInfo {
            schedule_id,
            started_id: EMPTY_EVENT_ID,
            activity_id: "a1".to_string(),
            request_id: String::new(),
            details: None,
            schedule_to_start_timeout: schedule_to_start,
            schedule_to_close_timeout: 0,
            start_to_close_timeout: start_to_close,
            heartbeat_timeout: 0,
            last_heartbeat: Utc::now(),
            cancel_requested: false,
        });
    }

    #[tokio::test]
    async fn test_activity_timeout_uses_staged_timeouts() {
        let timer_builder = builder();
        let mut mutable_state = MutableStateBuilder::new();
        staged_activity(&mut mutable_state, 5, 3, 0);

        let task = timer_builder
            .add_schedule_to_start_activity_timeout(5, &mutable_state)
            .await
            .unwrap()
            .expect("timeout configured, task expected");
        assert_eq!(task.task_type, TimerTaskType::ActivityTimeout);
        assert_eq!(task.timeout_type, TimeoutType::ScheduleToStart);
        assert_eq!(task.event_id, 5);
        let fire_in = task.visibility_time - Utc::now();
        assert!(fire_in <= Duration::seconds(3));
        assert!(fire_in > Duration::seconds(1));

        // No start-to-close timeout configured: no task.
        let none = timer_builder
            .add_start_to_close_activity_timeout(5, &mutable_state)
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_unknown_activity_is_an_error() {
        let timer_builder = builder();
        let mutable_state = MutableStateBuilder::new();
        let err = timer_builder
            .add_schedule_to_start_activity_timeout(99, &mutable_state)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_user_timer_pairs_info_with_task() {
        let timer_builder = builder();
        let mut mutable_state = MutableStateBuilder::new();
        let task = timer_builder
            .add_user_timer("t1", 5, 7, &mut mutable_state)
            .await
            .unwrap();

        let timer = mutable_state.get_user_timer("t1").expect("timer staged");
        assert_eq!(timer.task_id, task.task_id);
        assert_eq!(timer.started_event_id, 7);
        assert_eq!(timer.expiry_time, task.visibility_time);
    }

    #[tokio::test]
    async fn test_identical_expiries_get_distinct_task_ids() {
        let timer_builder = builder();
        let first = timer_builder.create_user_timer_task(1, 4).await.unwrap();
        let second = timer_builder.create_user_timer_task(1, 5).await.unwrap();
        assert!(second.task_id > first.task_id);
    }
}
