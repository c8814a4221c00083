// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History engine operations.
//!
//! These are the operations a frontend exposes over the wire; transport is
//! out of scope here, so each is a plain async method with typed request and
//! response structs.
//!
//! Every mutating operation runs the same optimistic loop: load the
//! execution and its mutable state, rebuild the builders, stage changes, and
//! commit one conditional update keyed on `next_event_id`. A version
//! mismatch re-reads and retries within a bounded budget; a lost shard lease
//! surfaces verbatim and is fatal to the owner.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use tempo_core::error::{CoreError, Result};
use tempo_core::persistence::{
    ActivityInfo, CreateWorkflowExecutionRequest, DecisionInfo, ExecutionStore,
    RecordExecutionClosedRequest, RecordExecutionStartedRequest, TimerTaskInfo, TransferTaskInfo,
    UpdateWorkflowExecutionRequest, VisibilityStore, WorkflowExecutionInfo,
};
use tempo_core::types::{
    Decision, EMPTY_EVENT_ID, TransferTaskType, WorkflowCloseStatus, WorkflowExecution,
    WorkflowState,
};

use crate::history_builder::HistoryBuilder;
use crate::mutable_state::MutableStateBuilder;
use crate::shard::ShardContext;
use crate::timer_builder::TimerBuilder;
use crate::timer_queue::TimerQueueProcessor;

/// Conditional-update attempts per operation before giving up.
pub const CONDITIONAL_RETRY_COUNT: usize = 5;

/// Request to start a new workflow execution.
#[derive(Debug, Clone)]
pub struct StartWorkflowExecutionRequest {
    /// Owning domain.
    pub domain_id: String,
    /// Caller-chosen workflow id, unique among open executions.
    pub workflow_id: String,
    /// Workflow type name.
    pub workflow_type: String,
    /// Decision task list for the execution.
    pub task_list: String,
    /// Opaque workflow input.
    pub input: Option<Vec<u8>>,
    /// Whole-execution timeout in seconds (0 = none).
    pub execution_start_to_close_timeout_seconds: i32,
    /// Per-decision-task timeout in seconds.
    pub task_start_to_close_timeout_seconds: i32,
    /// Identity of the starter.
    pub identity: String,
}

/// Response to a workflow start.
#[derive(Debug, Clone)]
pub struct StartWorkflowExecutionResponse {
    /// Run id of the new execution.
    pub run_id: String,
}

/// Response carrying an execution's next event id.
#[derive(Debug, Clone)]
pub struct GetWorkflowExecutionNextEventIdResponse {
    /// Run id of the addressed execution.
    pub run_id: String,
    /// Id the next appended event will receive.
    pub next_event_id: i64,
}

/// Request to record a decision task handed to a worker.
#[derive(Debug, Clone)]
pub struct RecordDecisionTaskStartedRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The execution.
    pub execution: WorkflowExecution,
    /// The DecisionTaskScheduled event the matching task referred to.
    pub schedule_id: i64,
    /// Poll request id, for redelivery dedup.
    pub request_id: String,
    /// Worker identity.
    pub identity: String,
}

/// Response to recording a decision task start.
#[derive(Debug, Clone)]
pub struct RecordDecisionTaskStartedResponse {
    /// The DecisionTaskStarted event id.
    pub started_event_id: i64,
}

/// Request to record an activity task handed to a worker.
#[derive(Debug, Clone)]
pub struct RecordActivityTaskStartedRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The execution.
    pub execution: WorkflowExecution,
    /// The ActivityTaskScheduled event the matching task referred to.
    pub schedule_id: i64,
    /// Poll request id, for redelivery dedup.
    pub request_id: String,
    /// Worker identity.
    pub identity: String,
}

/// Response to recording an activity task start.
#[derive(Debug, Clone)]
pub struct RecordActivityTaskStartedResponse {
    /// The ActivityTaskStarted event id.
    pub started_event_id: i64,
}

/// A decision worker's reply to a decision task.
#[derive(Debug, Clone)]
pub struct RespondDecisionTaskCompletedRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The execution.
    pub execution: WorkflowExecution,
    /// Decisions produced by the worker, applied in order.
    pub decisions: Vec<Decision>,
    /// Worker identity.
    pub identity: String,
}

/// An activity worker reporting success.
#[derive(Debug, Clone)]
pub struct RespondActivityTaskCompletedRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The execution.
    pub execution: WorkflowExecution,
    /// The ActivityTaskScheduled event id.
    pub schedule_id: i64,
    /// Opaque activity result.
    pub result: Option<Vec<u8>>,
    /// Worker identity.
    pub identity: String,
}

/// An activity worker reporting failure.
#[derive(Debug, Clone)]
pub struct RespondActivityTaskFailedRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The execution.
    pub execution: WorkflowExecution,
    /// The ActivityTaskScheduled event id.
    pub schedule_id: i64,
    /// Failure reason.
    pub reason: String,
    /// Opaque failure details.
    pub details: Option<Vec<u8>>,
    /// Worker identity.
    pub identity: String,
}

/// An activity worker acknowledging a cancel request.
#[derive(Debug, Clone)]
pub struct RespondActivityTaskCanceledRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The execution.
    pub execution: WorkflowExecution,
    /// The ActivityTaskScheduled event id.
    pub schedule_id: i64,
    /// Opaque cancellation details.
    pub details: Option<Vec<u8>>,
    /// Worker identity.
    pub identity: String,
}

/// An activity worker heartbeat.
#[derive(Debug, Clone)]
pub struct RecordActivityTaskHeartbeatRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The execution.
    pub execution: WorkflowExecution,
    /// The ActivityTaskScheduled event id.
    pub schedule_id: i64,
    /// Progress details, stored with the activity.
    pub details: Option<Vec<u8>>,
    /// Worker identity.
    pub identity: String,
}

/// Response to a heartbeat.
#[derive(Debug, Clone)]
pub struct RecordActivityTaskHeartbeatResponse {
    /// Whether a cancel has been requested for this activity.
    pub cancel_requested: bool,
}

/// Request to cancel a workflow execution cooperatively.
#[derive(Debug, Clone)]
pub struct RequestCancelWorkflowExecutionRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The execution.
    pub execution: WorkflowExecution,
    /// Why the cancel was requested.
    pub cause: String,
    /// Identity of the requester.
    pub identity: String,
}

/// Request to deliver an external signal.
#[derive(Debug, Clone)]
pub struct SignalWorkflowExecutionRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The execution.
    pub execution: WorkflowExecution,
    /// Signal name.
    pub signal_name: String,
    /// Opaque signal payload.
    pub input: Option<Vec<u8>>,
    /// Identity of the sender.
    pub identity: String,
}

/// Request to terminate a workflow execution immediately.
#[derive(Debug, Clone)]
pub struct TerminateWorkflowExecutionRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The execution.
    pub execution: WorkflowExecution,
    /// Termination reason.
    pub reason: String,
    /// Opaque details.
    pub details: Option<Vec<u8>>,
    /// Identity of the terminator.
    pub identity: String,
}

/// Request to make sure a decision task is scheduled.
#[derive(Debug, Clone)]
pub struct ScheduleDecisionTaskRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The execution.
    pub execution: WorkflowExecution,
}

/// A child execution reporting completion to its parent.
#[derive(Debug, Clone)]
pub struct RecordChildExecutionCompletedRequest {
    /// Owning domain.
    pub domain_id: String,
    /// The parent execution.
    pub execution: WorkflowExecution,
    /// The child execution.
    pub child_execution: WorkflowExecution,
    /// Child workflow type name.
    pub workflow_type: String,
    /// The parent-side initiation event id.
    pub initiated_event_id: i64,
    /// The child-side started event id.
    pub started_event_id: i64,
    /// Opaque child result.
    pub result: Option<Vec<u8>>,
}

/// Shared context one mutation attempt works over.
struct WorkflowContext {
    info: WorkflowExecutionInfo,
    history: HistoryBuilder,
    mutable_state: MutableStateBuilder,
    condition: i64,
}

/// Put a new decision task in flight: the scheduled event, the in-flight
/// decision record, and the transfer task that carries it to matching.
pub(crate) fn stage_decision_schedule(
    info: &mut WorkflowExecutionInfo,
    history: &mut HistoryBuilder,
    mutable_state: &mut MutableStateBuilder,
    transfer_tasks: &mut Vec<TransferTaskInfo>,
) -> i64 {
    let scheduled = history.add_decision_task_scheduled_event(
        &info.task_list,
        info.task_start_to_close_timeout_seconds,
    );
    mutable_state.set_decision(DecisionInfo {
        schedule_id: scheduled.event_id,
        started_id: EMPTY_EVENT_ID,
        request_id: String::new(),
        start_to_close_timeout: info.task_start_to_close_timeout_seconds,
    });
    info.decision_pending = true;
    transfer_tasks.push(TransferTaskInfo {
        task_id: 0,
        domain_id: info.domain_id.clone(),
        workflow_id: info.workflow_id.clone(),
        run_id: info.run_id.clone(),
        task_type: TransferTaskType::DecisionTask,
        task_list: info.task_list.clone(),
        schedule_id: scheduled.event_id,
        schedule_to_start_timeout_seconds: 0,
    });
    scheduled.event_id
}

/// The history service's operation surface for one shard.
pub struct HistoryEngine {
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    visibility: Arc<dyn VisibilityStore>,
    timer_builder: TimerBuilder,
    timer_processor: Arc<TimerQueueProcessor>,
}

impl HistoryEngine {
    /// Create an engine over a shard and its stores.
    pub fn new(
        shard: Arc<ShardContext>,
        execution_store: Arc<dyn ExecutionStore>,
        visibility: Arc<dyn VisibilityStore>,
        timer_processor: Arc<TimerQueueProcessor>,
    ) -> Self {
        let timer_builder = TimerBuilder::new(shard.clone());
        Self {
            shard,
            execution_store,
            visibility,
            timer_builder,
            timer_processor,
        }
    }

    /// Start a new workflow execution: the started event, the first decision
    /// task, and the execution timeout timer, committed atomically.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn start_workflow_execution(
        &self,
        request: StartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse> {
        if request.workflow_id.is_empty() {
            return Err(CoreError::InvalidArgument("workflow_id is required".to_string()));
        }
        if request.task_list.is_empty() {
            return Err(CoreError::InvalidArgument("task_list is required".to_string()));
        }
        if request.task_start_to_close_timeout_seconds <= 0 {
            return Err(CoreError::InvalidArgument(
                "task_start_to_close_timeout_seconds must be positive".to_string(),
            ));
        }

        let run_id = Uuid::new_v4().to_string();
        let execution = WorkflowExecution {
            workflow_id: request.workflow_id.clone(),
            run_id: run_id.clone(),
        };

        let mut history = HistoryBuilder::new();
        history.add_workflow_execution_started_event(
            &request.workflow_type,
            &request.task_list,
            request.input.clone(),
            request.execution_start_to_close_timeout_seconds,
            request.task_start_to_close_timeout_seconds,
            &request.identity,
        );
        let mut info = WorkflowExecutionInfo {
            domain_id: request.domain_id.clone(),
            workflow_id: request.workflow_id.clone(),
            run_id: run_id.clone(),
            workflow_type: request.workflow_type.clone(),
            task_list: request.task_list.clone(),
            history: Vec::new(),
            execution_start_to_close_timeout_seconds: request
                .execution_start_to_close_timeout_seconds,
            task_start_to_close_timeout_seconds: request.task_start_to_close_timeout_seconds,
            state: WorkflowState::Running,
            close_status: None,
            next_event_id: 0,
            last_processed_event_id: EMPTY_EVENT_ID,
            start_time: Utc::now(),
            last_updated: Utc::now(),
            decision_pending: false,
        };

        let mut mutable_state = MutableStateBuilder::new();
        let mut transfer_tasks = Vec::new();
        stage_decision_schedule(&mut info, &mut history, &mut mutable_state, &mut transfer_tasks);
        let decision = mutable_state.get_decision().cloned();

        let mut timer_tasks = Vec::new();
        if request.execution_start_to_close_timeout_seconds > 0 {
            let timeout_task = self
                .timer_builder
                .create_workflow_timeout_task(request.execution_start_to_close_timeout_seconds)
                .await?;
            timer_tasks.push(timeout_task.into_info(&request.domain_id, &execution));
        }

        info.history = history.serialize()?;
        info.next_event_id = history.next_event_id();

        self.shard
            .create_workflow_execution(CreateWorkflowExecutionRequest {
                shard_id: 0,
                range_id: 0,
                info: info.clone(),
                transfer_tasks,
                timer_tasks: timer_tasks.clone(),
                decision,
            })
            .await?;

        if let Err(e) = self
            .visibility
            .record_workflow_execution_started(RecordExecutionStartedRequest {
                domain_id: request.domain_id.clone(),
                execution: execution.clone(),
                workflow_type: request.workflow_type.clone(),
                start_time: info.start_time,
            })
            .await
        {
            warn!(workflow_id = %request.workflow_id, error = %e, "failed to record open execution");
        }
        self.notify_new_timers(&timer_tasks);

        info!(run_id = %run_id, "workflow execution started");
        Ok(StartWorkflowExecutionResponse { run_id })
    }

    /// Read the execution's next event id.
    pub async fn get_workflow_execution_next_event_id(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<GetWorkflowExecutionNextEventIdResponse> {
        let info = self
            .execution_store
            .get_workflow_execution(domain_id, execution)
            .await?;
        Ok(GetWorkflowExecutionNextEventIdResponse {
            run_id: info.run_id,
            next_event_id: info.next_event_id,
        })
    }

    /// Record a decision task claimed by a worker and cut its start-to-close
    /// timeout timer.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id))]
    pub async fn record_decision_task_started(
        &self,
        request: RecordDecisionTaskStartedRequest,
    ) -> Result<RecordDecisionTaskStartedResponse> {
        for _attempt in 0..=CONDITIONAL_RETRY_COUNT {
            let mut ctx = self.load_workflow(&request.domain_id, &request.execution).await?;

            let Some(decision) = ctx.mutable_state.get_decision().cloned() else {
                return Err(CoreError::NotFound(format!(
                    "no pending decision for workflow '{}'",
                    request.execution.workflow_id
                )));
            };
            if decision.schedule_id != request.schedule_id {
                return Err(CoreError::NotFound(format!(
                    "decision schedule id {} is not pending",
                    request.schedule_id
                )));
            }
            if decision.started_id != EMPTY_EVENT_ID {
                if decision.request_id == request.request_id {
                    return Ok(RecordDecisionTaskStartedResponse {
                        started_event_id: decision.started_id,
                    });
                }
                return Err(CoreError::TaskAlreadyStarted {
                    task: format!("decision {}", request.schedule_id),
                });
            }

            let started = ctx.history.add_decision_task_started_event(
                decision.schedule_id,
                &request.request_id,
                &request.identity,
            );
            ctx.mutable_state.set_decision(DecisionInfo {
                started_id: started.event_id,
                request_id: request.request_id.clone(),
                ..decision.clone()
            });

            let timeout_task = self
                .timer_builder
                .create_decision_timeout_task(decision.start_to_close_timeout, decision.schedule_id)
                .await?;
            let timer_tasks =
                vec![timeout_task.into_info(&request.domain_id, &request.execution)];

            match self.commit(ctx, Vec::new(), timer_tasks.clone()).await {
                Ok(()) => {
                    self.notify_new_timers(&timer_tasks);
                    return Ok(RecordDecisionTaskStartedResponse {
                        started_event_id: started.event_id,
                    });
                }
                Err(e) if e.is_condition_failed() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(retries_exhausted("record_decision_task_started"))
    }

    /// Record an activity task claimed by a worker and cut its start-to-close
    /// and heartbeat timers.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id))]
    pub async fn record_activity_task_started(
        &self,
        request: RecordActivityTaskStartedRequest,
    ) -> Result<RecordActivityTaskStartedResponse> {
        for _attempt in 0..=CONDITIONAL_RETRY_COUNT {
            let mut ctx = self.load_workflow(&request.domain_id, &request.execution).await?;

            let Some(activity) = ctx.mutable_state.get_activity(request.schedule_id).cloned()
            else {
                return Err(CoreError::NotFound(format!(
                    "no pending activity with schedule id {}",
                    request.schedule_id
                )));
            };
            if activity.started_id != EMPTY_EVENT_ID {
                if activity.request_id == request.request_id {
                    return Ok(RecordActivityTaskStartedResponse {
                        started_event_id: activity.started_id,
                    });
                }
                return Err(CoreError::TaskAlreadyStarted {
                    task: format!("activity {}", request.schedule_id),
                });
            }

            let started = ctx.history.add_activity_task_started_event(
                activity.schedule_id,
                &request.request_id,
                &request.identity,
            );
            ctx.mutable_state.update_activity(ActivityInfo {
                started_id: started.event_id,
                request_id: request.request_id.clone(),
                last_heartbeat: Utc::now(),
                ..activity
            });

            let mut timer_tasks = Vec::new();
            if let Some(task) = self
                .timer_builder
                .add_start_to_close_activity_timeout(request.schedule_id, &ctx.mutable_state)
                .await?
            {
                timer_tasks.push(task.into_info(&request.domain_id, &request.execution));
            }
            if let Some(task) = self
                .timer_builder
                .add_heart_beat_activity_timeout(request.schedule_id, &ctx.mutable_state)
                .await?
            {
                timer_tasks.push(task.into_info(&request.domain_id, &request.execution));
            }

            match self.commit(ctx, Vec::new(), timer_tasks.clone()).await {
                Ok(()) => {
                    self.notify_new_timers(&timer_tasks);
                    return Ok(RecordActivityTaskStartedResponse {
                        started_event_id: started.event_id,
                    });
                }
                Err(e) if e.is_condition_failed() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(retries_exhausted("record_activity_task_started"))
    }

    /// Apply a decision worker's reply: the completion event plus one event,
    /// state change, and task set per decision.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id))]
    pub async fn respond_decision_task_completed(
        &self,
        request: RespondDecisionTaskCompletedRequest,
    ) -> Result<()> {
        for _attempt in 0..=CONDITIONAL_RETRY_COUNT {
            let mut ctx = self.load_workflow(&request.domain_id, &request.execution).await?;

            let Some(decision) = ctx.mutable_state.get_decision().cloned() else {
                return Err(CoreError::NotFound(format!(
                    "no pending decision for workflow '{}'",
                    request.execution.workflow_id
                )));
            };
            if decision.started_id == EMPTY_EVENT_ID {
                return Err(CoreError::NotFound(format!(
                    "decision {} was never started",
                    decision.schedule_id
                )));
            }

            let completed = ctx.history.add_decision_task_completed_event(
                decision.schedule_id,
                decision.started_id,
                &request.identity,
            );
            ctx.mutable_state.clear_decision();
            ctx.info.decision_pending = false;
            ctx.info.last_processed_event_id = decision.started_id;

            let mut transfer_tasks = Vec::new();
            let mut timer_tasks = Vec::new();
            let mut cancelled_timer_rows = Vec::new();

            for decision_item in &request.decisions {
                if ctx.info.state == WorkflowState::Completed {
                    break;
                }
                self.apply_decision(
                    &request,
                    decision_item,
                    completed.event_id,
                    &mut ctx,
                    &mut transfer_tasks,
                    &mut timer_tasks,
                    &mut cancelled_timer_rows,
                )
                .await?;
            }

            let closed = ctx.info.state == WorkflowState::Completed;
            let close_status = ctx.info.close_status;
            let info_snapshot = ctx.info.clone();

            match self.commit(ctx, transfer_tasks, timer_tasks.clone()).await {
                Ok(()) => {
                    for (visibility_time, task_id) in cancelled_timer_rows {
                        if let Err(e) = self
                            .execution_store
                            .complete_timer_task(self.shard.shard_id(), visibility_time, task_id)
                            .await
                        {
                            warn!(task_id, error = %e, "failed to delete cancelled timer task");
                        }
                    }
                    if closed {
                        self.record_closed_visibility(&info_snapshot, close_status).await;
                    }
                    self.notify_new_timers(&timer_tasks);
                    return Ok(());
                }
                Err(e) if e.is_condition_failed() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(retries_exhausted("respond_decision_task_completed"))
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_decision(
        &self,
        request: &RespondDecisionTaskCompletedRequest,
        decision: &Decision,
        completed_event_id: i64,
        ctx: &mut WorkflowContext,
        transfer_tasks: &mut Vec<TransferTaskInfo>,
        timer_tasks: &mut Vec<TimerTaskInfo>,
        cancelled_timer_rows: &mut Vec<(chrono::DateTime<Utc>, i64)>,
    ) -> Result<()> {
        match decision {
            Decision::ScheduleActivityTask {
                activity_id,
                activity_type,
                task_list,
                input,
                schedule_to_close_timeout_seconds,
                schedule_to_start_timeout_seconds,
                start_to_close_timeout_seconds,
                heartbeat_timeout_seconds,
            } => {
                let scheduled = ctx.history.add_activity_task_scheduled_event(
                    completed_event_id,
                    activity_id,
                    activity_type,
                    task_list,
                    input.clone(),
                    *schedule_to_close_timeout_seconds,
                    *schedule_to_start_timeout_seconds,
                    *start_to_close_timeout_seconds,
                    *heartbeat_timeout_seconds,
                );
                ctx.mutable_state.update_activity(ActivityInfo {
                    schedule_id: scheduled.event_id,
                    started_id: EMPTY_EVENT_ID,
                    activity_id: activity_id.clone(),
                    request_id: String::new(),
                    details: None,
                    schedule_to_start_timeout: *schedule_to_start_timeout_seconds,
                    schedule_to_close_timeout: *schedule_to_close_timeout_seconds,
                    start_to_close_timeout: *start_to_close_timeout_seconds,
                    heartbeat_timeout: *heartbeat_timeout_seconds,
                    last_heartbeat: Utc::now(),
                    cancel_requested: false,
                });
                if let Some(task) = self
                    .timer_builder
                    .add_schedule_to_start_activity_timeout(scheduled.event_id, &ctx.mutable_state)
                    .await?
                {
                    timer_tasks.push(task.into_info(&request.domain_id, &request.execution));
                }
                if let Some(task) = self
                    .timer_builder
                    .add_schedule_to_close_activity_timeout(scheduled.event_id, &ctx.mutable_state)
                    .await?
                {
                    timer_tasks.push(task.into_info(&request.domain_id, &request.execution));
                }
                transfer_tasks.push(TransferTaskInfo {
                    task_id: 0,
                    domain_id: request.domain_id.clone(),
                    workflow_id: request.execution.workflow_id.clone(),
                    run_id: request.execution.run_id.clone(),
                    task_type: TransferTaskType::ActivityTask,
                    task_list: task_list.clone(),
                    schedule_id: scheduled.event_id,
                    schedule_to_start_timeout_seconds: *schedule_to_start_timeout_seconds,
                });
            }
            Decision::StartTimer {
                timer_id,
                start_to_fire_timeout_seconds,
            } => {
                if ctx.mutable_state.get_user_timer(timer_id).is_some() {
                    return Err(CoreError::InvalidArgument(format!(
                        "timer '{timer_id}' is already pending"
                    )));
                }
                let started = ctx.history.add_timer_started_event(
                    completed_event_id,
                    timer_id,
                    *start_to_fire_timeout_seconds,
                );
                let task = self
                    .timer_builder
                    .add_user_timer(
                        timer_id,
                        *start_to_fire_timeout_seconds,
                        started.event_id,
                        &mut ctx.mutable_state,
                    )
                    .await?;
                timer_tasks.push(task.into_info(&request.domain_id, &request.execution));
            }
            Decision::CancelTimer { timer_id } => {
                let Some(timer) = ctx.mutable_state.get_user_timer(timer_id).cloned() else {
                    return Err(CoreError::NotFound(format!(
                        "no pending timer '{timer_id}'"
                    )));
                };
                ctx.history.add_timer_canceled_event(
                    timer.started_event_id,
                    timer_id,
                    completed_event_id,
                    &request.identity,
                );
                ctx.mutable_state.delete_user_timer(timer_id);
                cancelled_timer_rows.push((timer.expiry_time, timer.task_id));
            }
            Decision::CompleteWorkflowExecution { result } => {
                ctx.history
                    .add_workflow_execution_completed_event(completed_event_id, result.clone());
                ctx.info.state = WorkflowState::Completed;
                ctx.info.close_status = Some(WorkflowCloseStatus::Completed);
            }
            Decision::FailWorkflowExecution { reason, details } => {
                ctx.history.add_workflow_execution_failed_event(
                    completed_event_id,
                    reason,
                    details.clone(),
                );
                ctx.info.state = WorkflowState::Completed;
                ctx.info.close_status = Some(WorkflowCloseStatus::Failed);
            }
        }
        Ok(())
    }

    /// Record an activity's success and wake the workflow with a new
    /// decision task.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id))]
    pub async fn respond_activity_task_completed(
        &self,
        request: RespondActivityTaskCompletedRequest,
    ) -> Result<()> {
        self.close_activity(
            &request.domain_id,
            &request.execution,
            request.schedule_id,
            ActivityClose::Completed {
                result: request.result.clone(),
                identity: request.identity.clone(),
            },
        )
        .await
    }

    /// Record an activity's failure and wake the workflow with a new
    /// decision task.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id))]
    pub async fn respond_activity_task_failed(
        &self,
        request: RespondActivityTaskFailedRequest,
    ) -> Result<()> {
        self.close_activity(
            &request.domain_id,
            &request.execution,
            request.schedule_id,
            ActivityClose::Failed {
                reason: request.reason.clone(),
                details: request.details.clone(),
                identity: request.identity.clone(),
            },
        )
        .await
    }

    /// Record an activity's cancellation and wake the workflow with a new
    /// decision task.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id))]
    pub async fn respond_activity_task_canceled(
        &self,
        request: RespondActivityTaskCanceledRequest,
    ) -> Result<()> {
        self.close_activity(
            &request.domain_id,
            &request.execution,
            request.schedule_id,
            ActivityClose::Canceled {
                details: request.details.clone(),
                identity: request.identity.clone(),
            },
        )
        .await
    }

    async fn close_activity(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        schedule_id: i64,
        close: ActivityClose,
    ) -> Result<()> {
        for _attempt in 0..=CONDITIONAL_RETRY_COUNT {
            let mut ctx = self.load_workflow(domain_id, execution).await?;

            let Some(activity) = ctx.mutable_state.get_activity(schedule_id).cloned() else {
                return Err(CoreError::NotFound(format!(
                    "no pending activity with schedule id {schedule_id}"
                )));
            };
            if activity.started_id == EMPTY_EVENT_ID {
                return Err(CoreError::NotFound(format!(
                    "activity {schedule_id} was never started"
                )));
            }

            match &close {
                ActivityClose::Completed { result, identity } => {
                    ctx.history.add_activity_task_completed_event(
                        activity.schedule_id,
                        activity.started_id,
                        result.clone(),
                        identity,
                    );
                }
                ActivityClose::Failed {
                    reason,
                    details,
                    identity,
                } => {
                    ctx.history.add_activity_task_failed_event(
                        activity.schedule_id,
                        activity.started_id,
                        reason,
                        details.clone(),
                        identity,
                    );
                }
                ActivityClose::Canceled { details, identity } => {
                    ctx.history.add_activity_task_canceled_event(
                        activity.schedule_id,
                        activity.started_id,
                        details.clone(),
                        identity,
                    );
                }
            }
            ctx.mutable_state.delete_activity(schedule_id);

            let mut transfer_tasks = Vec::new();
            if ctx.mutable_state.get_decision().is_none() {
                stage_decision_schedule(
                    &mut ctx.info,
                    &mut ctx.history,
                    &mut ctx.mutable_state,
                    &mut transfer_tasks,
                );
            }

            match self.commit(ctx, transfer_tasks, Vec::new()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_condition_failed() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(retries_exhausted("close_activity"))
    }

    /// Record a heartbeat: refreshes the activity's heartbeat clock and
    /// progress details, and reports whether a cancel is pending.
    pub async fn record_activity_task_heartbeat(
        &self,
        request: RecordActivityTaskHeartbeatRequest,
    ) -> Result<RecordActivityTaskHeartbeatResponse> {
        for _attempt in 0..=CONDITIONAL_RETRY_COUNT {
            let mut ctx = self.load_workflow(&request.domain_id, &request.execution).await?;

            let Some(activity) = ctx.mutable_state.get_activity(request.schedule_id).cloned()
            else {
                return Err(CoreError::NotFound(format!(
                    "no pending activity with schedule id {}",
                    request.schedule_id
                )));
            };
            if activity.started_id == EMPTY_EVENT_ID {
                return Err(CoreError::NotFound(format!(
                    "activity {} was never started",
                    request.schedule_id
                )));
            }
            let cancel_requested = activity.cancel_requested;
            ctx.mutable_state.update_activity(ActivityInfo {
                details: request.details.clone(),
                last_heartbeat: Utc::now(),
                ..activity
            });

            match self.commit(ctx, Vec::new(), Vec::new()).await {
                Ok(()) => return Ok(RecordActivityTaskHeartbeatResponse { cancel_requested }),
                Err(e) if e.is_condition_failed() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(retries_exhausted("record_activity_task_heartbeat"))
    }

    /// Ask the workflow to cancel: records the request, flags every pending
    /// activity, and wakes the workflow with a decision task.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id))]
    pub async fn request_cancel_workflow_execution(
        &self,
        request: RequestCancelWorkflowExecutionRequest,
    ) -> Result<()> {
        for _attempt in 0..=CONDITIONAL_RETRY_COUNT {
            let mut ctx = self.load_workflow(&request.domain_id, &request.execution).await?;

            ctx.history
                .add_workflow_execution_cancel_requested_event(&request.cause, &request.identity);
            let pending: Vec<ActivityInfo> = ctx
                .mutable_state
                .pending_activities()
                .filter(|activity| !activity.cancel_requested)
                .cloned()
                .collect();
            for activity in pending {
                ctx.mutable_state.update_activity(ActivityInfo {
                    cancel_requested: true,
                    ..activity
                });
            }

            let mut transfer_tasks = Vec::new();
            if ctx.mutable_state.get_decision().is_none() {
                stage_decision_schedule(
                    &mut ctx.info,
                    &mut ctx.history,
                    &mut ctx.mutable_state,
                    &mut transfer_tasks,
                );
            }

            match self.commit(ctx, transfer_tasks, Vec::new()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_condition_failed() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(retries_exhausted("request_cancel_workflow_execution"))
    }

    /// Deliver an external signal and wake the workflow with a decision
    /// task.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id))]
    pub async fn signal_workflow_execution(
        &self,
        request: SignalWorkflowExecutionRequest,
    ) -> Result<()> {
        for _attempt in 0..=CONDITIONAL_RETRY_COUNT {
            let mut ctx = self.load_workflow(&request.domain_id, &request.execution).await?;

            ctx.history.add_workflow_execution_signaled_event(
                &request.signal_name,
                request.input.clone(),
                &request.identity,
            );

            let mut transfer_tasks = Vec::new();
            if ctx.mutable_state.get_decision().is_none() {
                stage_decision_schedule(
                    &mut ctx.info,
                    &mut ctx.history,
                    &mut ctx.mutable_state,
                    &mut transfer_tasks,
                );
            }

            match self.commit(ctx, transfer_tasks, Vec::new()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_condition_failed() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(retries_exhausted("signal_workflow_execution"))
    }

    /// Terminate the execution immediately, without consulting the workflow.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id))]
    pub async fn terminate_workflow_execution(
        &self,
        request: TerminateWorkflowExecutionRequest,
    ) -> Result<()> {
        for _attempt in 0..=CONDITIONAL_RETRY_COUNT {
            let mut ctx = self.load_workflow(&request.domain_id, &request.execution).await?;

            ctx.history.add_workflow_execution_terminated_event(
                &request.reason,
                request.details.clone(),
                &request.identity,
            );
            ctx.info.state = WorkflowState::Completed;
            ctx.info.close_status = Some(WorkflowCloseStatus::Terminated);
            ctx.info.decision_pending = false;
            ctx.mutable_state.clear_decision();

            let info_snapshot = ctx.info.clone();
            match self.commit(ctx, Vec::new(), Vec::new()).await {
                Ok(()) => {
                    self.record_closed_visibility(
                        &info_snapshot,
                        Some(WorkflowCloseStatus::Terminated),
                    )
                    .await;
                    return Ok(());
                }
                Err(e) if e.is_condition_failed() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(retries_exhausted("terminate_workflow_execution"))
    }

    /// Make sure a decision task is in flight; a no-op when one already is.
    pub async fn schedule_decision_task(
        &self,
        request: ScheduleDecisionTaskRequest,
    ) -> Result<()> {
        for _attempt in 0..=CONDITIONAL_RETRY_COUNT {
            let mut ctx = self.load_workflow(&request.domain_id, &request.execution).await?;
            if ctx.mutable_state.get_decision().is_some() {
                return Ok(());
            }
            let mut transfer_tasks = Vec::new();
            stage_decision_schedule(
                &mut ctx.info,
                &mut ctx.history,
                &mut ctx.mutable_state,
                &mut transfer_tasks,
            );
            match self.commit(ctx, transfer_tasks, Vec::new()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_condition_failed() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(retries_exhausted("schedule_decision_task"))
    }

    /// Record a child execution's completion in the parent's history and
    /// wake the parent with a decision task.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id))]
    pub async fn record_child_execution_completed(
        &self,
        request: RecordChildExecutionCompletedRequest,
    ) -> Result<()> {
        for _attempt in 0..=CONDITIONAL_RETRY_COUNT {
            let mut ctx = self.load_workflow(&request.domain_id, &request.execution).await?;

            ctx.history.add_child_workflow_execution_completed_event(
                request.child_execution.clone(),
                &request.workflow_type,
                request.initiated_event_id,
                request.started_event_id,
                request.result.clone(),
            );

            let mut transfer_tasks = Vec::new();
            if ctx.mutable_state.get_decision().is_none() {
                stage_decision_schedule(
                    &mut ctx.info,
                    &mut ctx.history,
                    &mut ctx.mutable_state,
                    &mut transfer_tasks,
                );
            }

            match self.commit(ctx, transfer_tasks, Vec::new()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_condition_failed() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(retries_exhausted("record_child_execution_completed"))
    }

    async fn load_workflow(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowContext> {
        let info = self
            .execution_store
            .get_workflow_execution(domain_id, execution)
            .await?;
        if info.state == WorkflowState::Completed {
            return Err(CoreError::ExecutionAlreadyCompleted {
                workflow_id: execution.workflow_id.clone(),
                run_id: execution.run_id.clone(),
            });
        }
        let snapshot = self
            .execution_store
            .get_workflow_mutable_state(domain_id, execution)
            .await?;
        let history = HistoryBuilder::load_execution_info(&info)?;
        let mut mutable_state = MutableStateBuilder::new();
        mutable_state.load(snapshot);
        let condition = info.next_event_id;
        Ok(WorkflowContext {
            info,
            history,
            mutable_state,
            condition,
        })
    }

    async fn commit(
        &self,
        ctx: WorkflowContext,
        transfer_tasks: Vec<TransferTaskInfo>,
        timer_tasks: Vec<TimerTaskInfo>,
    ) -> Result<()> {
        let WorkflowContext {
            mut info,
            history,
            mutable_state,
            condition,
        } = ctx;
        info.history = history.serialize()?;
        info.next_event_id = history.next_event_id();
        let mut request = UpdateWorkflowExecutionRequest {
            info: Some(info),
            condition,
            transfer_tasks,
            timer_tasks,
            ..Default::default()
        };
        mutable_state.stage(&mut request);
        self.shard.update_workflow_execution(request).await
    }

    async fn record_closed_visibility(
        &self,
        info: &WorkflowExecutionInfo,
        status: Option<WorkflowCloseStatus>,
    ) {
        let request = RecordExecutionClosedRequest {
            domain_id: info.domain_id.clone(),
            execution: WorkflowExecution {
                workflow_id: info.workflow_id.clone(),
                run_id: info.run_id.clone(),
            },
            workflow_type: info.workflow_type.clone(),
            start_time: info.start_time,
            close_time: Utc::now(),
            status: status.unwrap_or(WorkflowCloseStatus::Completed),
            retention_seconds: None,
        };
        if let Err(e) = self.visibility.record_workflow_execution_closed(request).await {
            warn!(workflow_id = %info.workflow_id, error = %e, "failed to record closed execution");
        }
    }

    fn notify_new_timers(&self, timer_tasks: &[TimerTaskInfo]) {
        if let Some(task) = timer_tasks.first() {
            self.timer_processor.notify_new_timer(task.task_id);
        }
    }
}

enum ActivityClose {
    Completed {
        result: Option<Vec<u8>>,
        identity: String,
    },
    Failed {
        reason: String,
        details: Option<Vec<u8>>,
        identity: String,
    },
    Canceled {
        details: Option<Vec<u8>>,
        identity: String,
    },
}

fn retries_exhausted(operation: &str) -> CoreError {
    CoreError::ConditionFailed {
        operation: operation.to_string(),
        details: "conditional update retries exhausted".to_string(),
    }
}
