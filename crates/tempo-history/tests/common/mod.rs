// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for history integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tempo_core::error::{CoreError, Result};
use tempo_core::persistence::{
    CreateWorkflowExecutionRequest, ExecutionStore, MemoryStore, ShardInfo, ShardStore,
    TimerTaskInfo, TransferTaskInfo, UpdateWorkflowExecutionRequest, WorkflowExecutionInfo,
    WorkflowMutableState,
};
use tempo_core::types::{EMPTY_EVENT_ID, WorkflowExecution, WorkflowState};
use tempo_history::history_builder::HistoryBuilder;
use tempo_history::timer_queue::TimerQueueProcessorConfig;
use tempo_history::transfer_queue::TransferQueueProcessorConfig;
use tempo_matching::{MatchingConfig, MatchingEngine};

pub const DOMAIN_ID: &str = "test-domain";
pub const SHARD_ID: i32 = 0;

/// Matching tuned for fast tests.
pub fn fast_matching_config() -> MatchingConfig {
    MatchingConfig {
        dispatch_timeout: Duration::from_millis(200),
        idle_scan_interval: Duration::from_millis(25),
        ..MatchingConfig::default()
    }
}

/// Timer processor tuned for fast tests.
pub fn fast_timer_config() -> TimerQueueProcessorConfig {
    TimerQueueProcessorConfig {
        poll_interval: Duration::from_millis(25),
        ..TimerQueueProcessorConfig::default()
    }
}

/// Transfer processor tuned for fast tests.
pub fn fast_transfer_config() -> TransferQueueProcessorConfig {
    TransferQueueProcessorConfig {
        poll_interval: Duration::from_millis(25),
        ..TransferQueueProcessorConfig::default()
    }
}

/// A full in-process deployment over one memory store.
pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub matching: Arc<MatchingEngine>,
    pub history: tempo_history::HistoryService,
}

impl TestApp {
    pub async fn start() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let store = Arc::new(MemoryStore::new());
        let matching = Arc::new(MatchingEngine::new(store.clone(), fast_matching_config()));
        let history = tempo_history::HistoryService::builder()
            .shard_id(SHARD_ID)
            .timer_config(fast_timer_config())
            .transfer_config(fast_transfer_config())
            .start(
                store.clone(),
                store.clone(),
                store.clone(),
                matching.clone(),
            )
            .await
            .expect("history service must start");
        Self {
            store,
            matching,
            history,
        }
    }

    pub async fn load_history(&self, execution: &WorkflowExecution) -> HistoryBuilder {
        let info = self
            .store
            .get_workflow_execution(DOMAIN_ID, execution)
            .await
            .expect("execution must exist");
        HistoryBuilder::load_execution_info(&info).expect("history must deserialize")
    }

    pub async fn mutable_state(&self, execution: &WorkflowExecution) -> WorkflowMutableState {
        self.store
            .get_workflow_mutable_state(DOMAIN_ID, execution)
            .await
            .expect("execution must exist")
    }

    pub async fn timer_task_count(&self) -> usize {
        self.store.timer_task_count(SHARD_ID).await
    }

    pub async fn shutdown(self) {
        self.history.shutdown().await;
        self.matching.shutdown().await;
    }
}

/// Evaluate `$cond` every 20ms until it holds or `$deadline` elapses;
/// yields `true` on success. `$cond` may await.
macro_rules! eventually {
    ($deadline:expr, $cond:expr) => {{
        let deadline: std::time::Duration = $deadline;
        let start = tokio::time::Instant::now();
        loop {
            if $cond {
                break true;
            }
            if start.elapsed() > deadline {
                break false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }};
}
pub(crate) use eventually;

/// A minimal running execution written straight to the store, for tests
/// that drive the timer queue without the engine.
pub fn new_execution_info(
    workflow_id: &str,
    run_id: &str,
    task_list: &str,
    history: &HistoryBuilder,
) -> WorkflowExecutionInfo {
    WorkflowExecutionInfo {
        domain_id: DOMAIN_ID.to_string(),
        workflow_id: workflow_id.to_string(),
        run_id: run_id.to_string(),
        workflow_type: "test-workflow".to_string(),
        task_list: task_list.to_string(),
        history: history.serialize().expect("history must serialize"),
        execution_start_to_close_timeout_seconds: 0,
        task_start_to_close_timeout_seconds: 1,
        state: WorkflowState::Running,
        close_status: None,
        next_event_id: history.next_event_id(),
        last_processed_event_id: EMPTY_EVENT_ID,
        start_time: Utc::now(),
        last_updated: Utc::now(),
        decision_pending: true,
    }
}

/// Write an execution row directly under the given shard lease.
pub async fn create_execution_directly(
    store: &MemoryStore,
    range_id: i64,
    info: WorkflowExecutionInfo,
    timer_tasks: Vec<TimerTaskInfo>,
) {
    store
        .create_workflow_execution(CreateWorkflowExecutionRequest {
            shard_id: SHARD_ID,
            range_id,
            info,
            transfer_tasks: Vec::new(),
            timer_tasks,
            decision: None,
        })
        .await
        .expect("create must succeed");
}

/// The Go-test idiom: re-read the row, swap in new history and staged
/// state, and commit under the stored condition.
pub async fn update_history_and_timers(
    store: &MemoryStore,
    range_id: i64,
    execution: &WorkflowExecution,
    history: &HistoryBuilder,
    timer_tasks: Vec<TimerTaskInfo>,
    request_mutations: impl FnOnce(&mut UpdateWorkflowExecutionRequest),
) {
    let mut info = store
        .get_workflow_execution(DOMAIN_ID, execution)
        .await
        .expect("execution must exist");
    let condition = info.next_event_id;
    info.history = history.serialize().expect("history must serialize");
    info.next_event_id = history.next_event_id();

    let mut request = UpdateWorkflowExecutionRequest {
        shard_id: SHARD_ID,
        range_id,
        info: Some(info),
        condition,
        timer_tasks,
        ..Default::default()
    };
    request_mutations(&mut request);
    store
        .update_workflow_execution(request)
        .await
        .expect("update must succeed");
}

/// Store decorator that fails the first N conditional updates, standing in
/// for a concurrent writer winning the race.
pub struct ContentionStore {
    inner: Arc<MemoryStore>,
    failures_left: AtomicUsize,
}

impl ContentionStore {
    pub fn new(inner: Arc<MemoryStore>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures_left: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl ShardStore for ContentionStore {
    async fn get_or_create_shard(&self, shard_id: i32) -> Result<ShardInfo> {
        self.inner.get_or_create_shard(shard_id).await
    }

    async fn update_shard(&self, shard: ShardInfo, previous_range_id: i64) -> Result<()> {
        self.inner.update_shard(shard, previous_range_id).await
    }
}

#[async_trait]
impl ExecutionStore for ContentionStore {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<()> {
        self.inner.create_workflow_execution(request).await
    }

    async fn get_workflow_execution(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecutionInfo> {
        self.inner.get_workflow_execution(domain_id, execution).await
    }

    async fn get_workflow_mutable_state(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowMutableState> {
        self.inner
            .get_workflow_mutable_state(domain_id, execution)
            .await
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<()> {
        let left = self.failures_left.load(Ordering::Acquire);
        if left > 0
            && self
                .failures_left
                .compare_exchange(left, left - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Err(CoreError::ConditionFailed {
                operation: "update_workflow_execution".to_string(),
                details: "injected contention".to_string(),
            });
        }
        self.inner.update_workflow_execution(request).await
    }

    async fn get_timer_index_tasks(
        &self,
        shard_id: i32,
        min_visibility: DateTime<Utc>,
        max_visibility: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<TimerTaskInfo>> {
        self.inner
            .get_timer_index_tasks(shard_id, min_visibility, max_visibility, batch_size)
            .await
    }

    async fn complete_timer_task(
        &self,
        shard_id: i32,
        visibility_time: DateTime<Utc>,
        task_id: i64,
    ) -> Result<()> {
        self.inner
            .complete_timer_task(shard_id, visibility_time, task_id)
            .await
    }

    async fn get_transfer_tasks(
        &self,
        shard_id: i32,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TransferTaskInfo>> {
        self.inner
            .get_transfer_tasks(shard_id, read_level, max_read_level, batch_size)
            .await
    }

    async fn complete_transfer_task(&self, shard_id: i32, task_id: i64) -> Result<()> {
        self.inner.complete_transfer_task(shard_id, task_id).await
    }
}
