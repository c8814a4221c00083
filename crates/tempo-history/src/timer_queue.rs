// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timer queue processor: durable timeout firing against workflow state.
//!
//! The processor keeps a per-shard in-memory priority queue keyed by
//! `(visibility_time, task_id)`, seeded and refilled from the durable timer
//! index within a lookahead window. It sleeps until the head is due or a
//! new-timer notification arrives (a notification can only pull the wake-up
//! earlier, never push it later).
//!
//! Firing is at-least-once with at-most-once effect: a timeout event is
//! appended under the workflow's conditional update, so a crash between
//! commit and index-row deletion only re-runs the validity check, which then
//! sees the state has moved on and deletes the row without a second event.
//!
//! Per task the state machine is `Scheduled → Firing → (Fired | Stale)`;
//! both terminal states delete the index row.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tempo_core::error::{CoreError, Result};
use tempo_core::persistence::{
    ExecutionStore, RecordExecutionClosedRequest, TimerTaskInfo, TransferTaskInfo,
    UpdateWorkflowExecutionRequest, VisibilityStore, WorkflowExecutionInfo,
};
use tempo_core::types::{
    EMPTY_EVENT_ID, TimeoutType, TimerTaskType, WorkflowCloseStatus, WorkflowExecution,
    WorkflowState,
};

use crate::engine::stage_decision_schedule;
use crate::history_builder::HistoryBuilder;
use crate::mutable_state::MutableStateBuilder;
use crate::shard::ShardContext;
use crate::timer_builder::TimerBuilder;

/// Timer queue processor tuning knobs.
#[derive(Debug, Clone)]
pub struct TimerQueueProcessorConfig {
    /// How far past now the index scan looks when seeding the queue.
    pub lookahead: Duration,
    /// Maximum timers fired per cycle before yielding to notifications.
    pub max_fire_batch_size: usize,
    /// Wake-up interval when no timer is near.
    pub poll_interval: Duration,
    /// Conditional-update retries per firing before the cycle is abandoned.
    pub conditional_retry_count: usize,
    /// Rows fetched per timer index scan.
    pub scan_batch_size: usize,
}

impl Default for TimerQueueProcessorConfig {
    fn default() -> Self {
        Self {
            lookahead: Duration::from_secs(5),
            max_fire_batch_size: 100,
            poll_interval: Duration::from_secs(1),
            conditional_retry_count: 5,
            scan_batch_size: 100,
        }
    }
}

/// Terminal outcome of one firing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireOutcome {
    /// A timeout event was committed.
    Fired,
    /// The validity check failed; state had moved on.
    Stale,
}

struct HeapEntry {
    task: TimerTaskInfo,
}

impl HeapEntry {
    fn key(&self) -> (DateTime<Utc>, i64) {
        (self.task.visibility_time, self.task.task_id)
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    // Reversed so the BinaryHeap pops the earliest key first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

/// Fires due timers for one shard.
pub struct TimerQueueProcessor {
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    visibility: Arc<dyn VisibilityStore>,
    timer_builder: TimerBuilder,
    config: TimerQueueProcessorConfig,
    timer_fired_count: AtomicU64,
    new_timer_tx: mpsc::Sender<()>,
    new_timer_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerQueueProcessor {
    /// Create a processor for a shard.
    pub fn new(
        shard: Arc<ShardContext>,
        execution_store: Arc<dyn ExecutionStore>,
        visibility: Arc<dyn VisibilityStore>,
        config: TimerQueueProcessorConfig,
    ) -> Arc<Self> {
        let (new_timer_tx, new_timer_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);
        let timer_builder = TimerBuilder::new(shard.clone());
        Arc::new(Self {
            shard,
            execution_store,
            visibility,
            timer_builder,
            config,
            timer_fired_count: AtomicU64::new(0),
            new_timer_tx,
            new_timer_rx: Mutex::new(Some(new_timer_rx)),
            shutdown_tx,
            handle: Mutex::new(None),
        })
    }

    /// Start the processing loop. Idempotent; the second call is a no-op.
    pub async fn start(self: Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let Some(rx) = self.new_timer_rx.lock().await.take() else {
            return;
        };
        let processor = self.clone();
        *handle = Some(tokio::spawn(processor.run(rx)));
    }

    /// Stop after the current cycle; an in-flight conditional update is
    /// never aborted mid-commit.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Tell the processor a timer task was just persisted. Only ever
    /// advances the next wake-up; a full channel means a wake-up is already
    /// pending.
    pub fn notify_new_timer(&self, task_id: i64) {
        debug!(shard_id = self.shard.shard_id(), task_id, "new timer notification");
        let _ = self.new_timer_tx.try_send(());
    }

    /// Number of timers fired since start. Exposed for tests.
    pub fn timer_fired_count(&self) -> u64 {
        self.timer_fired_count.load(Ordering::Relaxed)
    }

    async fn run(self: Arc<Self>, mut new_timer_rx: mpsc::Receiver<()>) {
        info!(shard_id = self.shard.shard_id(), "timer queue processor started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut close_rx = self.shard.close_receiver();
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
        let mut in_heap: HashSet<i64> = HashSet::new();

        loop {
            self.refill_queue(&mut heap, &mut in_heap).await;
            let fired_full_batch = self.fire_due_timers(&mut heap, &mut in_heap).await;
            if fired_full_batch {
                // More work may already be due; yield once so notifications
                // and pollers get a turn, then go again.
                tokio::task::yield_now().await;
                continue;
            }

            let sleep_for = match heap.peek() {
                Some(entry) => {
                    let until_due = (entry.task.visibility_time - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    until_due.min(self.config.poll_interval)
                }
                None => self.config.poll_interval,
            };

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = close_rx.changed() => {
                    if *close_rx.borrow() {
                        warn!(shard_id = self.shard.shard_id(), "shard closed, stopping timer queue");
                        break;
                    }
                }

                _ = new_timer_rx.recv() => {}

                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        info!(shard_id = self.shard.shard_id(), "timer queue processor stopped");
    }

    /// Pull index rows due within the lookahead window into the in-memory
    /// queue, skipping rows already queued.
    async fn refill_queue(&self, heap: &mut BinaryHeap<HeapEntry>, in_heap: &mut HashSet<i64>) {
        let max_visibility = Utc::now()
            + chrono::Duration::from_std(self.config.lookahead).unwrap_or(chrono::Duration::zero());
        match self
            .execution_store
            .get_timer_index_tasks(
                self.shard.shard_id(),
                DateTime::<Utc>::UNIX_EPOCH,
                max_visibility,
                self.config.scan_batch_size,
            )
            .await
        {
            Ok(tasks) => {
                for task in tasks {
                    if in_heap.insert(task.task_id) {
                        heap.push(HeapEntry { task });
                    }
                }
            }
            Err(e) => {
                warn!(shard_id = self.shard.shard_id(), error = %e, "timer index scan failed");
            }
        }
    }

    /// Fire every due timer up to the batch cap. Returns true when the cap
    /// was hit with work still due.
    async fn fire_due_timers(
        &self,
        heap: &mut BinaryHeap<HeapEntry>,
        in_heap: &mut HashSet<i64>,
    ) -> bool {
        let mut fired_this_cycle = 0;
        let mut max_fired_visibility: Option<DateTime<Utc>> = None;

        while let Some(entry) = heap.peek() {
            if entry.task.visibility_time > Utc::now() {
                break;
            }
            if fired_this_cycle >= self.config.max_fire_batch_size {
                return true;
            }
            let Some(entry) = heap.pop() else { break };
            in_heap.remove(&entry.task.task_id);
            let task = entry.task;
            fired_this_cycle += 1;

            match self.process_timer_task(&task).await {
                Ok(outcome) => {
                    if let Err(e) = self
                        .execution_store
                        .complete_timer_task(
                            self.shard.shard_id(),
                            task.visibility_time,
                            task.task_id,
                        )
                        .await
                    {
                        warn!(task_id = task.task_id, error = %e, "failed to delete fired timer task");
                    }
                    if outcome == FireOutcome::Fired {
                        self.timer_fired_count.fetch_add(1, Ordering::Relaxed);
                    }
                    max_fired_visibility = Some(task.visibility_time);
                }
                Err(e) => {
                    // Leave the index row; the next scan sees the task again.
                    warn!(
                        task_id = task.task_id,
                        workflow_id = %task.workflow_id,
                        error = %e,
                        "timer firing abandoned for this cycle"
                    );
                }
            }
        }

        if let Some(level) = max_fired_visibility
            && let Err(e) = self.shard.update_timer_ack_level(level).await
        {
            warn!(error = %e, "failed to persist timer ack level");
        }
        false
    }

    /// Load, validate, and fire one timer task with bounded conditional
    /// retries.
    async fn process_timer_task(&self, task: &TimerTaskInfo) -> Result<FireOutcome> {
        let execution = WorkflowExecution {
            workflow_id: task.workflow_id.clone(),
            run_id: task.run_id.clone(),
        };

        for _attempt in 0..=self.config.conditional_retry_count {
            let info = match self
                .execution_store
                .get_workflow_execution(&task.domain_id, &execution)
                .await
            {
                Ok(info) => info,
                Err(CoreError::ExecutionNotFound { .. }) => return Ok(FireOutcome::Stale),
                Err(e) => return Err(e),
            };
            if info.state == WorkflowState::Completed {
                return Ok(FireOutcome::Stale);
            }
            let snapshot = self
                .execution_store
                .get_workflow_mutable_state(&task.domain_id, &execution)
                .await?;

            let mut history = HistoryBuilder::load_execution_info(&info)?;
            let mut mutable_state = MutableStateBuilder::new();
            mutable_state.load(snapshot);
            let condition = info.next_event_id;
            let mut info = info;
            let mut transfer_tasks: Vec<TransferTaskInfo> = Vec::new();
            let mut timer_tasks: Vec<TimerTaskInfo> = Vec::new();

            let live = match task.task_type {
                TimerTaskType::UserTimer => {
                    if self.fire_user_timer(task, &mut history, &mut mutable_state) {
                        self.schedule_decision_if_needed(
                            &mut info,
                            &mut history,
                            &mut mutable_state,
                            &mut transfer_tasks,
                        );
                        true
                    } else {
                        false
                    }
                }
                TimerTaskType::ActivityTimeout => {
                    match self
                        .fire_activity_timeout(task, &mut history, &mut mutable_state, &mut timer_tasks)
                        .await?
                    {
                        ActivityFire::Live => {
                            self.schedule_decision_if_needed(
                                &mut info,
                                &mut history,
                                &mut mutable_state,
                                &mut transfer_tasks,
                            );
                            true
                        }
                        ActivityFire::Stale => false,
                        ActivityFire::Rearmed => {
                            // Commit just the replacement timer task under the
                            // same condition.
                            let request = UpdateWorkflowExecutionRequest {
                                info: Some(info.clone()),
                                condition,
                                timer_tasks,
                                ..Default::default()
                            };
                            match self.shard.update_workflow_execution(request).await {
                                Ok(()) => return Ok(FireOutcome::Stale),
                                Err(e) if e.is_condition_failed() => continue,
                                Err(e) => return Err(e),
                            }
                        }
                    }
                }
                TimerTaskType::DecisionTimeout => self.fire_decision_timeout(
                    task,
                    &mut info,
                    &mut history,
                    &mut mutable_state,
                    &mut transfer_tasks,
                ),
                TimerTaskType::WorkflowTimeout => {
                    history.add_workflow_execution_timed_out_event(TimeoutType::StartToClose);
                    info.state = WorkflowState::Completed;
                    info.close_status = Some(WorkflowCloseStatus::TimedOut);
                    info.decision_pending = false;
                    mutable_state.clear_decision();
                    true
                }
            };

            if !live {
                return Ok(FireOutcome::Stale);
            }

            info.history = history.serialize()?;
            info.next_event_id = history.next_event_id();
            let closed = info.state == WorkflowState::Completed;
            let mut request = UpdateWorkflowExecutionRequest {
                info: Some(info.clone()),
                condition,
                transfer_tasks,
                timer_tasks,
                ..Default::default()
            };
            mutable_state.stage(&mut request);

            match self.shard.update_workflow_execution(request).await {
                Ok(()) => {
                    if closed {
                        self.record_closed_visibility(&info, &execution).await;
                    }
                    return Ok(FireOutcome::Fired);
                }
                Err(e) if e.is_condition_failed() => {
                    debug!(task_id = task.task_id, "conditional update lost the race, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(CoreError::ConditionFailed {
            operation: "fire_timer_task".to_string(),
            details: "conditional update retries exhausted".to_string(),
        })
    }

    fn fire_user_timer(
        &self,
        task: &TimerTaskInfo,
        history: &mut HistoryBuilder,
        mutable_state: &mut MutableStateBuilder,
    ) -> bool {
        // The durable task id is the timer's identity; the user-facing
        // timer id only keys the workflow's timer map.
        let Some(timer) = mutable_state.get_user_timer_by_task_id(task.task_id).cloned() else {
            return false;
        };
        history.add_timer_fired_event(timer.started_event_id, &timer.timer_id);
        mutable_state.delete_user_timer(&timer.timer_id);
        true
    }

    async fn fire_activity_timeout(
        &self,
        task: &TimerTaskInfo,
        history: &mut HistoryBuilder,
        mutable_state: &mut MutableStateBuilder,
        timer_tasks: &mut Vec<TimerTaskInfo>,
    ) -> Result<ActivityFire> {
        let Some(activity) = mutable_state.get_activity(task.event_id).cloned() else {
            return Ok(ActivityFire::Stale);
        };
        let started = activity.started_id != EMPTY_EVENT_ID;
        let valid = match task.timeout_type {
            TimeoutType::ScheduleToStart => !started,
            TimeoutType::StartToClose => started,
            TimeoutType::ScheduleToClose => true,
            TimeoutType::Heartbeat => {
                if !started {
                    return Ok(ActivityFire::Stale);
                }
                let due = activity.last_heartbeat
                    + chrono::Duration::seconds(activity.heartbeat_timeout as i64);
                if due > Utc::now() {
                    // A heartbeat arrived since this task was cut; enforce
                    // the deadline from the heartbeat instead of firing.
                    let rearm = self
                        .timer_builder
                        .create_heartbeat_rearm_task(
                            activity.schedule_id,
                            activity.last_heartbeat,
                            activity.heartbeat_timeout,
                        )
                        .await?;
                    let execution = WorkflowExecution {
                        workflow_id: task.workflow_id.clone(),
                        run_id: task.run_id.clone(),
                    };
                    timer_tasks.push(rearm.into_info(&task.domain_id, &execution));
                    return Ok(ActivityFire::Rearmed);
                }
                true
            }
        };
        if !valid {
            return Ok(ActivityFire::Stale);
        }
        history.add_activity_task_timed_out_event(
            activity.schedule_id,
            activity.started_id,
            task.timeout_type,
            activity.details.clone(),
        );
        mutable_state.delete_activity(activity.schedule_id);
        Ok(ActivityFire::Live)
    }

    fn fire_decision_timeout(
        &self,
        task: &TimerTaskInfo,
        info: &mut WorkflowExecutionInfo,
        history: &mut HistoryBuilder,
        mutable_state: &mut MutableStateBuilder,
        transfer_tasks: &mut Vec<TransferTaskInfo>,
    ) -> bool {
        let Some(decision) = mutable_state.get_decision().cloned() else {
            return false;
        };
        if decision.schedule_id != task.event_id {
            return false;
        }
        let started = decision.started_id != EMPTY_EVENT_ID;
        let valid = match task.timeout_type {
            TimeoutType::StartToClose => started,
            TimeoutType::ScheduleToStart => !started,
            _ => false,
        };
        if !valid {
            return false;
        }

        history.add_decision_task_timed_out_event(
            decision.schedule_id,
            decision.started_id,
            task.timeout_type,
        );
        mutable_state.clear_decision();
        info.decision_pending = false;
        // Schedule the next decision attempt.
        self.schedule_decision_if_needed(info, history, mutable_state, transfer_tasks);
        true
    }

    fn schedule_decision_if_needed(
        &self,
        info: &mut WorkflowExecutionInfo,
        history: &mut HistoryBuilder,
        mutable_state: &mut MutableStateBuilder,
        transfer_tasks: &mut Vec<TransferTaskInfo>,
    ) {
        if mutable_state.get_decision().is_some() {
            return;
        }
        stage_decision_schedule(info, history, mutable_state, transfer_tasks);
    }

    async fn record_closed_visibility(
        &self,
        info: &WorkflowExecutionInfo,
        execution: &WorkflowExecution,
    ) {
        let request = RecordExecutionClosedRequest {
            domain_id: info.domain_id.clone(),
            execution: execution.clone(),
            workflow_type: info.workflow_type.clone(),
            start_time: info.start_time,
            close_time: Utc::now(),
            status: info.close_status.unwrap_or(WorkflowCloseStatus::TimedOut),
            retention_seconds: None,
        };
        if let Err(e) = self.visibility.record_workflow_execution_closed(request).await {
            warn!(workflow_id = %execution.workflow_id, error = %e, "failed to record closed execution");
        }
    }
}

enum ActivityFire {
    Live,
    Stale,
    Rearmed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(visibility_offset_ms: i64, task_id: i64) -> HeapEntry {
        HeapEntry {
            task: TimerTaskInfo {
                task_id,
                domain_id: "d".to_string(),
                workflow_id: "w".to_string(),
                run_id: "r".to_string(),
                task_type: TimerTaskType::UserTimer,
                timeout_type: TimeoutType::StartToClose,
                event_id: 1,
                visibility_time: DateTime::<Utc>::UNIX_EPOCH
                    + chrono::Duration::milliseconds(visibility_offset_ms),
            },
        }
    }

    #[test]
    fn test_heap_pops_earliest_visibility_first() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(3_000, 1));
        heap.push(entry(1_000, 2));
        heap.push(entry(2_000, 3));
        let order: Vec<i64> = std::iter::from_fn(|| heap.pop().map(|e| e.task.task_id)).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_heap_breaks_expiry_ties_by_task_id() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(1_000, 9));
        heap.push(entry(1_000, 4));
        heap.push(entry(1_000, 7));
        let order: Vec<i64> = std::iter::from_fn(|| heap.pop().map(|e| e.task.task_id)).collect();
        assert_eq!(order, vec![4, 7, 9]);
    }
}
