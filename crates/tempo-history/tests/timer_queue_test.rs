// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timer queue processor behavior, driven directly against the store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use common::{
    ContentionStore, DOMAIN_ID, SHARD_ID, create_execution_directly, eventually,
    fast_timer_config, new_execution_info, update_history_and_timers,
};
use tempo_core::events::EventType;
use tempo_core::persistence::{
    ActivityInfo, DecisionInfo, ExecutionStore, MemoryStore, TimerTaskInfo,
};
use tempo_core::types::{
    EMPTY_EVENT_ID, TimeoutType, TimerTaskType, WorkflowExecution,
};
use tempo_history::history_builder::HistoryBuilder;
use tempo_history::mutable_state::MutableStateBuilder;
use tempo_history::shard::ShardContext;
use tempo_history::timer_builder::{LocalSequenceNumberGenerator, TimerBuilder};
use tempo_history::timer_queue::TimerQueueProcessor;

struct Harness {
    store: Arc<MemoryStore>,
    processor: Arc<TimerQueueProcessor>,
    timer_builder: TimerBuilder,
    execution: WorkflowExecution,
    range_id: i64,
}

impl Harness {
    async fn start(workflow_id: &str) -> Self {
        let store = Arc::new(MemoryStore::new());
        let shard = ShardContext::acquire(store.clone(), store.clone(), SHARD_ID, 100_000)
            .await
            .expect("shard must be acquirable");
        let range_id = shard.range_id().await;
        let processor = TimerQueueProcessor::new(
            shard.clone(),
            store.clone(),
            store.clone(),
            fast_timer_config(),
        );
        processor.clone().start().await;
        Self {
            store,
            processor,
            timer_builder: TimerBuilder::new(Arc::new(LocalSequenceNumberGenerator::new(100))),
            execution: WorkflowExecution {
                workflow_id: workflow_id.to_string(),
                run_id: Uuid::new_v4().to_string(),
            },
            range_id,
        }
    }

    /// History with the standard prologue: started, decision scheduled,
    /// decision started.
    fn prologue(&self) -> (HistoryBuilder, i64, i64) {
        let mut builder = HistoryBuilder::new();
        builder.add_workflow_execution_started_event(
            "test-workflow",
            "test-list",
            None,
            0,
            1,
            "starter",
        );
        let scheduled = builder.add_decision_task_scheduled_event("test-list", 1);
        let started = builder.add_decision_task_started_event(
            scheduled.event_id,
            &Uuid::new_v4().to_string(),
            "worker",
        );
        (builder, scheduled.event_id, started.event_id)
    }

    async fn create_execution(&self, builder: &HistoryBuilder) {
        let info = new_execution_info(
            &self.execution.workflow_id,
            &self.execution.run_id,
            "test-list",
            builder,
        );
        create_execution_directly(&self.store, self.range_id, info, Vec::new()).await;
    }

    async fn wait_for_empty_timer_index(&self) {
        let drained = eventually!(
            Duration::from_secs(10),
            self.store.timer_task_count(SHARD_ID).await == 0
        );
        assert!(drained, "timer index never drained");
    }

    async fn load_history(&self) -> HistoryBuilder {
        let info = self
            .store
            .get_workflow_execution(DOMAIN_ID, &self.execution)
            .await
            .expect("execution must exist");
        HistoryBuilder::load_execution_info(&info).expect("history must deserialize")
    }

    async fn stop(&self) {
        self.processor.stop().await;
    }
}

#[tokio::test]
async fn test_single_user_timer_fires() {
    let harness = Harness::start("single-timer-test").await;
    let (mut builder, _, started_id) = harness.prologue();
    harness.create_execution(&builder).await;

    let timer_started = builder.add_timer_started_event(started_id, "tid1", 1);
    let mut mutable_state = MutableStateBuilder::new();
    let task = harness
        .timer_builder
        .add_user_timer("tid1", 1, timer_started.event_id, &mut mutable_state)
        .await
        .unwrap();
    let task_id = task.task_id;
    update_history_and_timers(
        &harness.store,
        harness.range_id,
        &harness.execution,
        &builder,
        vec![task.into_info(DOMAIN_ID, &harness.execution)],
        |request| mutable_state.stage(request),
    )
    .await;

    // Exactly one index row backs the pending timer until it fires.
    assert_eq!(harness.store.timer_task_count(SHARD_ID).await, 1);
    harness.processor.notify_new_timer(task_id);

    harness.wait_for_empty_timer_index().await;
    assert_eq!(harness.processor.timer_fired_count(), 1);

    let history = harness.load_history().await;
    assert_eq!(history.count_events_of_type(EventType::TimerFired), 1);
    let state = harness
        .store
        .get_workflow_mutable_state(DOMAIN_ID, &harness.execution)
        .await
        .unwrap();
    assert!(state.timer_infos.is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_three_user_timers_fire_in_expiry_order() {
    let harness = Harness::start("multiple-timer-test").await;
    let (mut builder, _, started_id) = harness.prologue();
    harness.create_execution(&builder).await;

    let mut mutable_state = MutableStateBuilder::new();
    let mut timer_tasks = Vec::new();
    for (timer_id, fire_in) in [("tid1", 1), ("tid2", 2), ("tid3", 3)] {
        let timer_started = builder.add_timer_started_event(started_id, timer_id, fire_in);
        let task = harness
            .timer_builder
            .add_user_timer(timer_id, fire_in, timer_started.event_id, &mut mutable_state)
            .await
            .unwrap();
        timer_tasks.push(task.into_info(DOMAIN_ID, &harness.execution));
    }
    update_history_and_timers(
        &harness.store,
        harness.range_id,
        &harness.execution,
        &builder,
        timer_tasks,
        |request| mutable_state.stage(request),
    )
    .await;

    // One index row per pending user timer.
    assert_eq!(harness.store.timer_task_count(SHARD_ID).await, 3);

    harness.wait_for_empty_timer_index().await;
    assert_eq!(harness.processor.timer_fired_count(), 3);

    // Fire events land in non-decreasing expiry order.
    let history = harness.load_history().await;
    let fired_order: Vec<String> = history
        .events()
        .iter()
        .filter_map(|event| match &event.attributes {
            tempo_core::events::EventAttributes::TimerFired { timer_id, .. } => {
                Some(timer_id.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(fired_order, vec!["tid1", "tid2", "tid3"]);

    harness.stop().await;
}

#[tokio::test]
async fn test_decision_timeout_schedules_next_attempt() {
    let harness = Harness::start("decision-timeout-test").await;
    let (builder, schedule_id, started_id) = harness.prologue();
    harness.create_execution(&builder).await;

    let task = harness
        .timer_builder
        .create_decision_timeout_task(1, schedule_id)
        .await
        .unwrap();
    let task_id = task.task_id;
    update_history_and_timers(
        &harness.store,
        harness.range_id,
        &harness.execution,
        &builder,
        vec![task.into_info(DOMAIN_ID, &harness.execution)],
        |request| {
            request.decision = Some(DecisionInfo {
                schedule_id,
                started_id,
                request_id: Uuid::new_v4().to_string(),
                start_to_close_timeout: 1,
            });
        },
    )
    .await;
    harness.processor.notify_new_timer(task_id);

    harness.wait_for_empty_timer_index().await;
    assert_eq!(harness.processor.timer_fired_count(), 1);

    let history = harness.load_history().await;
    assert_eq!(history.count_events_of_type(EventType::DecisionTaskTimedOut), 1);
    // The next decision attempt is scheduled and in flight.
    assert_eq!(history.count_events_of_type(EventType::DecisionTaskScheduled), 2);
    let state = harness
        .store
        .get_workflow_mutable_state(DOMAIN_ID, &harness.execution)
        .await
        .unwrap();
    let decision = state.decision.expect("next decision attempt must be pending");
    assert_ne!(decision.schedule_id, schedule_id);
    assert_eq!(decision.started_id, EMPTY_EVENT_ID);

    harness.stop().await;
}

fn activity_info(schedule_id: i64, started_id: i64) -> ActivityInfo {
    ActivityInfo {
        schedule_id,
        started_id,
        activity_id: "a1".to_string(),
        request_id: String::new(),
        details: None,
        schedule_to_start_timeout: 0,
        schedule_to_close_timeout: 0,
        start_to_close_timeout: 0,
        heartbeat_timeout: 0,
        last_heartbeat: Utc::now(),
        cancel_requested: false,
    }
}

#[tokio::test]
async fn test_schedule_to_start_fires_when_activity_never_starts() {
    let harness = Harness::start("activity-sts-test").await;
    let (mut builder, _, started_id) = harness.prologue();
    harness.create_execution(&builder).await;

    let scheduled = builder.add_activity_task_scheduled_event(
        started_id, "a1", "charge", "test-list", None, 0, 1, 0, 0,
    );
    let mut mutable_state = MutableStateBuilder::new();
    mutable_state.update_activity(ActivityInfo {
        schedule_to_start_timeout: 1,
        ..activity_info(scheduled.event_id, EMPTY_EVENT_ID)
    });
    let task = harness
        .timer_builder
        .add_schedule_to_start_activity_timeout(scheduled.event_id, &mutable_state)
        .await
        .unwrap()
        .expect("schedule-to-start timer expected");
    update_history_and_timers(
        &harness.store,
        harness.range_id,
        &harness.execution,
        &builder,
        vec![task.into_info(DOMAIN_ID, &harness.execution)],
        |request| mutable_state.stage(request),
    )
    .await;

    harness.wait_for_empty_timer_index().await;
    assert_eq!(harness.processor.timer_fired_count(), 1);

    let history = harness.load_history().await;
    let timed_out = history
        .events()
        .iter()
        .find_map(|event| match &event.attributes {
            tempo_core::events::EventAttributes::ActivityTaskTimedOut {
                scheduled_event_id,
                timeout_type,
                ..
            } => Some((*scheduled_event_id, *timeout_type)),
            _ => None,
        })
        .expect("timeout event expected");
    assert_eq!(timed_out, (scheduled.event_id, TimeoutType::ScheduleToStart));

    let state = harness
        .store
        .get_workflow_mutable_state(DOMAIN_ID, &harness.execution)
        .await
        .unwrap();
    assert!(state.activity_infos.is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_schedule_to_start_is_stale_once_activity_starts() {
    let harness = Harness::start("activity-sts-started-test").await;
    let (mut builder, _, started_id) = harness.prologue();
    harness.create_execution(&builder).await;

    let scheduled = builder.add_activity_task_scheduled_event(
        started_id, "a1", "charge", "test-list", None, 0, 1, 0, 0,
    );
    let activity_started =
        builder.add_activity_task_started_event(scheduled.event_id, "req", "worker");
    let mut mutable_state = MutableStateBuilder::new();
    mutable_state.update_activity(ActivityInfo {
        schedule_to_start_timeout: 1,
        ..activity_info(scheduled.event_id, activity_started.event_id)
    });
    let task = harness
        .timer_builder
        .add_schedule_to_start_activity_timeout(scheduled.event_id, &mutable_state)
        .await
        .unwrap()
        .expect("schedule-to-start timer expected");
    update_history_and_timers(
        &harness.store,
        harness.range_id,
        &harness.execution,
        &builder,
        vec![task.into_info(DOMAIN_ID, &harness.execution)],
        |request| mutable_state.stage(request),
    )
    .await;

    harness.wait_for_empty_timer_index().await;

    // Stale: deleted without producing an event, the activity survives.
    assert_eq!(harness.processor.timer_fired_count(), 0);
    let history = harness.load_history().await;
    assert_eq!(history.count_events_of_type(EventType::ActivityTaskTimedOut), 0);
    let state = harness
        .store
        .get_workflow_mutable_state(DOMAIN_ID, &harness.execution)
        .await
        .unwrap();
    assert!(state.activity_infos.contains_key(&scheduled.event_id));

    harness.stop().await;
}

#[tokio::test]
async fn test_start_to_close_after_completion_is_stale() {
    let harness = Harness::start("activity-stc-completed-test").await;
    let (mut builder, _, started_id) = harness.prologue();
    harness.create_execution(&builder).await;

    let scheduled = builder.add_activity_task_scheduled_event(
        started_id, "a1", "charge", "test-list", None, 0, 0, 1, 0,
    );
    let activity_started =
        builder.add_activity_task_started_event(scheduled.event_id, "req", "worker");

    // Derive the timer while the activity is still running; the activity
    // then completes in the same update, so no activity info is persisted.
    let mut scratch_state = MutableStateBuilder::new();
    scratch_state.update_activity(ActivityInfo {
        start_to_close_timeout: 1,
        ..activity_info(scheduled.event_id, activity_started.event_id)
    });
    let task = harness
        .timer_builder
        .add_start_to_close_activity_timeout(scheduled.event_id, &scratch_state)
        .await
        .unwrap()
        .expect("start-to-close timer expected");

    builder.add_activity_task_completed_event(
        scheduled.event_id,
        activity_started.event_id,
        Some(b"result".to_vec()),
        "worker",
    );
    update_history_and_timers(
        &harness.store,
        harness.range_id,
        &harness.execution,
        &builder,
        vec![task.into_info(DOMAIN_ID, &harness.execution)],
        |_| {},
    )
    .await;

    harness.wait_for_empty_timer_index().await;

    // The validity check fails; the task is deleted without an event and
    // history still ends with the completion.
    assert_eq!(harness.processor.timer_fired_count(), 0);
    let history = harness.load_history().await;
    assert_eq!(history.count_events_of_type(EventType::ActivityTaskTimedOut), 0);
    assert_eq!(
        history.last_event().map(|event| event.event_type()),
        Some(EventType::ActivityTaskCompleted)
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_schedule_to_close_fires_regardless_of_start() {
    let harness = Harness::start("activity-stc-test").await;
    let (mut builder, _, started_id) = harness.prologue();
    harness.create_execution(&builder).await;

    let scheduled = builder.add_activity_task_scheduled_event(
        started_id, "a1", "charge", "test-list", None, 1, 0, 0, 0,
    );
    let activity_started =
        builder.add_activity_task_started_event(scheduled.event_id, "req", "worker");
    let mut mutable_state = MutableStateBuilder::new();
    mutable_state.update_activity(ActivityInfo {
        schedule_to_close_timeout: 1,
        ..activity_info(scheduled.event_id, activity_started.event_id)
    });
    let task = harness
        .timer_builder
        .add_schedule_to_close_activity_timeout(scheduled.event_id, &mutable_state)
        .await
        .unwrap()
        .expect("schedule-to-close timer expected");
    update_history_and_timers(
        &harness.store,
        harness.range_id,
        &harness.execution,
        &builder,
        vec![task.into_info(DOMAIN_ID, &harness.execution)],
        |request| mutable_state.stage(request),
    )
    .await;

    harness.wait_for_empty_timer_index().await;
    assert_eq!(harness.processor.timer_fired_count(), 1);
    let state = harness
        .store
        .get_workflow_mutable_state(DOMAIN_ID, &harness.execution)
        .await
        .unwrap();
    assert!(state.activity_infos.is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_heartbeat_timeout_fires_when_heartbeat_is_stale() {
    let harness = Harness::start("activity-heartbeat-test").await;
    let (mut builder, _, started_id) = harness.prologue();
    harness.create_execution(&builder).await;

    let scheduled = builder.add_activity_task_scheduled_event(
        started_id, "a1", "charge", "test-list", None, 0, 0, 0, 1,
    );
    let activity_started =
        builder.add_activity_task_started_event(scheduled.event_id, "req", "worker");
    let mut mutable_state = MutableStateBuilder::new();
    mutable_state.update_activity(ActivityInfo {
        heartbeat_timeout: 1,
        last_heartbeat: Utc::now() - chrono::Duration::seconds(5),
        ..activity_info(scheduled.event_id, activity_started.event_id)
    });
    let task = harness
        .timer_builder
        .add_heart_beat_activity_timeout(scheduled.event_id, &mutable_state)
        .await
        .unwrap()
        .expect("heartbeat timer expected");
    update_history_and_timers(
        &harness.store,
        harness.range_id,
        &harness.execution,
        &builder,
        vec![task.into_info(DOMAIN_ID, &harness.execution)],
        |request| mutable_state.stage(request),
    )
    .await;

    harness.wait_for_empty_timer_index().await;
    assert_eq!(harness.processor.timer_fired_count(), 1);
    let history = harness.load_history().await;
    assert_eq!(history.count_events_of_type(EventType::ActivityTaskTimedOut), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_heartbeat_timer_rearms_after_recent_heartbeat() {
    let harness = Harness::start("activity-heartbeat-rearm-test").await;
    let (mut builder, _, started_id) = harness.prologue();
    harness.create_execution(&builder).await;

    let scheduled = builder.add_activity_task_scheduled_event(
        started_id, "a1", "charge", "test-list", None, 0, 0, 0, 1,
    );
    let activity_started =
        builder.add_activity_task_started_event(scheduled.event_id, "req", "worker");
    let mut mutable_state = MutableStateBuilder::new();
    mutable_state.update_activity(ActivityInfo {
        heartbeat_timeout: 1,
        last_heartbeat: Utc::now(),
        ..activity_info(scheduled.event_id, activity_started.event_id)
    });
    // A task already due while the heartbeat is fresh, as after a crashed
    // firing attempt.
    let stale_task = TimerTaskInfo {
        task_id: 999,
        domain_id: DOMAIN_ID.to_string(),
        workflow_id: harness.execution.workflow_id.clone(),
        run_id: harness.execution.run_id.clone(),
        task_type: TimerTaskType::ActivityTimeout,
        timeout_type: TimeoutType::Heartbeat,
        event_id: scheduled.event_id,
        visibility_time: Utc::now(),
    };
    update_history_and_timers(
        &harness.store,
        harness.range_id,
        &harness.execution,
        &builder,
        vec![stale_task],
        |request| mutable_state.stage(request),
    )
    .await;
    harness.processor.notify_new_timer(999);

    // The premature task is replaced, then the replacement fires once the
    // heartbeat goes stale.
    let fired = eventually!(
        Duration::from_secs(10),
        harness.processor.timer_fired_count() == 1
    );
    assert!(fired, "re-armed heartbeat timer never fired");
    let state = harness
        .store
        .get_workflow_mutable_state(DOMAIN_ID, &harness.execution)
        .await
        .unwrap();
    assert!(state.activity_infos.is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_contended_update_retries_and_fires_once() {
    let store = Arc::new(MemoryStore::new());
    let contended = ContentionStore::new(store.clone(), 1);
    let shard = ShardContext::acquire(contended.clone(), contended.clone(), SHARD_ID, 100_000)
        .await
        .unwrap();
    let range_id = shard.range_id().await;
    let processor = TimerQueueProcessor::new(
        shard.clone(),
        contended.clone(),
        store.clone(),
        fast_timer_config(),
    );

    let execution = WorkflowExecution {
        workflow_id: "contended-update-test".to_string(),
        run_id: Uuid::new_v4().to_string(),
    };
    let mut builder = HistoryBuilder::new();
    builder.add_workflow_execution_started_event("test-workflow", "test-list", None, 0, 1, "starter");
    let scheduled = builder.add_decision_task_scheduled_event("test-list", 1);
    let started = builder.add_decision_task_started_event(
        scheduled.event_id,
        &Uuid::new_v4().to_string(),
        "worker",
    );
    let info = new_execution_info(&execution.workflow_id, &execution.run_id, "test-list", &builder);
    create_execution_directly(&store, range_id, info, Vec::new()).await;

    let timer_builder = TimerBuilder::new(Arc::new(LocalSequenceNumberGenerator::new(100)));
    let task = timer_builder
        .create_decision_timeout_task(1, scheduled.event_id)
        .await
        .unwrap();
    update_history_and_timers(&store, range_id, &execution, &builder, vec![
        task.into_info(DOMAIN_ID, &execution),
    ], |request| {
        request.decision = Some(DecisionInfo {
            schedule_id: scheduled.event_id,
            started_id: started.event_id,
            request_id: Uuid::new_v4().to_string(),
            start_to_close_timeout: 1,
        });
    })
    .await;

    processor.clone().start().await;

    // The first conditional update is rejected; the retry commits and the
    // fired counter moves exactly once.
    let fired = eventually!(
        Duration::from_secs(10),
        processor.timer_fired_count() == 1
    );
    assert!(fired, "timer never fired through the contention");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(processor.timer_fired_count(), 1);
    assert_eq!(store.timer_task_count(SHARD_ID).await, 0);

    processor.stop().await;
}
