//! SQLite-backed persistence implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::info;

use crate::error::{CoreError, Result};
use crate::types::{TaskListId, WorkflowCloseStatus, WorkflowExecution};

use super::{
    CreateWorkflowExecutionRequest, DEFAULT_CLOSE_TTL_SECONDS, ExecutionStore,
    ListExecutionsRequest, ListExecutionsResponse, RecordExecutionClosedRequest,
    RecordExecutionStartedRequest, ShardInfo, ShardStore, TaskInfo, TaskListInfo, TaskStore,
    TimerTaskInfo, TransferTaskInfo, UpdateWorkflowExecutionRequest, VisibilityFilter,
    VisibilityStore, WorkflowExecutionInfo, WorkflowExecutionRecord, WorkflowMutableState,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed store implementing all persistence traits.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing pool. Migrations must already have run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store backed by a database file.
    ///
    /// Creates parent directories and the database file as needed, connects,
    /// and runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrate(&pool).await?;
        info!(path = %path.display(), "SQLite store ready");
        Ok(Self { pool })
    }

    /// Create and initialize a store backed by a single in-memory database.
    ///
    /// The pool is capped at one connection so every operation sees the same
    /// database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        MIGRATOR.run(pool).await.map_err(|e| CoreError::Database {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })
    }
}

fn millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn close_status_to_str(status: WorkflowCloseStatus) -> &'static str {
    match status {
        WorkflowCloseStatus::Completed => "completed",
        WorkflowCloseStatus::Failed => "failed",
        WorkflowCloseStatus::Terminated => "terminated",
        WorkflowCloseStatus::TimedOut => "timed_out",
    }
}

fn close_status_from_str(value: &str) -> Result<WorkflowCloseStatus> {
    match value {
        "completed" => Ok(WorkflowCloseStatus::Completed),
        "failed" => Ok(WorkflowCloseStatus::Failed),
        "terminated" => Ok(WorkflowCloseStatus::Terminated),
        "timed_out" => Ok(WorkflowCloseStatus::TimedOut),
        other => Err(CoreError::Database {
            operation: "decode".to_string(),
            details: format!("unknown close status '{other}'"),
        }),
    }
}

fn decode_blob<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let bytes: Vec<u8> = row.try_get(column)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl ShardStore for SqliteStore {
    async fn get_or_create_shard(&self, shard_id: i32) -> Result<ShardInfo> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO shards (shard_id, range_id, transfer_ack_level, timer_ack_ms, updated_ms)
            VALUES (?, 0, 0, 0, ?)
            "#,
        )
        .bind(shard_id)
        .bind(millis(now))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT range_id, transfer_ack_level, timer_ack_ms, updated_ms
            FROM shards
            WHERE shard_id = ?
            "#,
        )
        .bind(shard_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ShardInfo {
            shard_id,
            range_id: row.try_get("range_id")?,
            transfer_ack_level: row.try_get("transfer_ack_level")?,
            timer_ack_level: from_millis(row.try_get("timer_ack_ms")?),
            updated_at: from_millis(row.try_get("updated_ms")?),
        })
    }

    async fn update_shard(&self, shard: ShardInfo, previous_range_id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE shards
            SET range_id = ?, transfer_ack_level = ?, timer_ack_ms = ?, updated_ms = ?
            WHERE shard_id = ? AND range_id = ?
            "#,
        )
        .bind(shard.range_id)
        .bind(shard.transfer_ack_level)
        .bind(millis(shard.timer_ack_level))
        .bind(millis(Utc::now()))
        .bind(shard.shard_id)
        .bind(previous_range_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let stored: Option<i64> = sqlx::query_scalar("SELECT range_id FROM shards WHERE shard_id = ?")
                .bind(shard.shard_id)
                .fetch_optional(&self.pool)
                .await?;
            return Err(match stored {
                Some(range_id) => CoreError::ShardOwnershipLost {
                    shard_id: shard.shard_id,
                    details: format!(
                        "update_shard expected range_id {previous_range_id}, store has {range_id}"
                    ),
                },
                None => CoreError::NotFound(format!("shard {}", shard.shard_id)),
            });
        }
        Ok(())
    }
}

impl SqliteStore {
    async fn check_shard_range(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        shard_id: i32,
        range_id: i64,
        operation: &str,
    ) -> Result<()> {
        let stored: Option<i64> = sqlx::query_scalar("SELECT range_id FROM shards WHERE shard_id = ?")
            .bind(shard_id)
            .fetch_optional(&mut **tx)
            .await?;
        match stored {
            None => Err(CoreError::NotFound(format!("shard {shard_id}"))),
            Some(stored) if stored != range_id => Err(CoreError::ShardOwnershipLost {
                shard_id,
                details: format!("{operation} carried range_id {range_id}, store has {stored}"),
            }),
            Some(_) => Ok(()),
        }
    }

    async fn insert_shard_tasks(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        shard_id: i32,
        transfer_tasks: &[TransferTaskInfo],
        timer_tasks: &[TimerTaskInfo],
    ) -> Result<()> {
        for task in transfer_tasks {
            sqlx::query(
                r#"
                INSERT INTO transfer_tasks (shard_id, task_id, data)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(shard_id)
            .bind(task.task_id)
            .bind(serde_json::to_vec(task)?)
            .execute(&mut **tx)
            .await?;
        }
        for task in timer_tasks {
            sqlx::query(
                r#"
                INSERT INTO timer_tasks (shard_id, visibility_ms, task_id, data)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(shard_id)
            .bind(millis(task.visibility_time))
            .bind(task.task_id)
            .bind(serde_json::to_vec(task)?)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.check_shard_range(&mut tx, request.shard_id, request.range_id, "create_workflow_execution")
            .await?;

        let info = &request.info;
        let running: Option<String> = sqlx::query_scalar(
            r#"
            SELECT run_id FROM executions
            WHERE domain_id = ? AND workflow_id = ? AND state = 'running'
            "#,
        )
        .bind(&info.domain_id)
        .bind(&info.workflow_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(run_id) = running {
            return Err(CoreError::ExecutionAlreadyStarted {
                workflow_id: info.workflow_id.clone(),
                run_id,
            });
        }

        let decision_blob = match &request.decision {
            Some(decision) => Some(serde_json::to_vec(decision)?),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO executions (domain_id, workflow_id, run_id, state, next_event_id, decision, data)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&info.domain_id)
        .bind(&info.workflow_id)
        .bind(&info.run_id)
        .bind(state_to_str(info.state))
        .bind(info.next_event_id)
        .bind(decision_blob)
        .bind(serde_json::to_vec(info)?)
        .execute(&mut *tx)
        .await?;

        self.insert_shard_tasks(
            &mut tx,
            request.shard_id,
            &request.transfer_tasks,
            &request.timer_tasks,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecutionInfo> {
        let row = sqlx::query(
            r#"
            SELECT data FROM executions
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(domain_id)
        .bind(&execution.workflow_id)
        .bind(&execution.run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::ExecutionNotFound {
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id.clone(),
        })?;
        decode_blob(&row, "data")
    }

    async fn get_workflow_mutable_state(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowMutableState> {
        let row = sqlx::query(
            r#"
            SELECT next_event_id, state, decision FROM executions
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(domain_id)
        .bind(&execution.workflow_id)
        .bind(&execution.run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::ExecutionNotFound {
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id.clone(),
        })?;

        let mut state = WorkflowMutableState {
            next_event_id: row.try_get("next_event_id")?,
            state: Some(state_from_str(row.try_get("state")?)?),
            ..Default::default()
        };
        let decision: Option<Vec<u8>> = row.try_get("decision")?;
        if let Some(bytes) = decision {
            state.decision = Some(serde_json::from_slice(&bytes)?);
        }

        let rows = sqlx::query(
            r#"
            SELECT data FROM activity_infos
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(domain_id)
        .bind(&execution.workflow_id)
        .bind(&execution.run_id)
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let activity: super::ActivityInfo = decode_blob(&row, "data")?;
            state.activity_infos.insert(activity.schedule_id, activity);
        }

        let rows = sqlx::query(
            r#"
            SELECT data FROM timer_infos
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(domain_id)
        .bind(&execution.workflow_id)
        .bind(&execution.run_id)
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let timer: super::TimerInfo = decode_blob(&row, "data")?;
            state.timer_infos.insert(timer.timer_id.clone(), timer);
        }

        Ok(state)
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<()> {
        let info = request.info.ok_or_else(|| {
            CoreError::InvalidArgument("update_workflow_execution requires info".to_string())
        })?;

        let mut tx = self.pool.begin().await?;
        self.check_shard_range(&mut tx, request.shard_id, request.range_id, "update_workflow_execution")
            .await?;

        let mut info = info;
        info.last_updated = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET state = ?, next_event_id = ?, data = ?
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ? AND next_event_id = ?
            "#,
        )
        .bind(state_to_str(info.state))
        .bind(info.next_event_id)
        .bind(serde_json::to_vec(&info)?)
        .bind(&info.domain_id)
        .bind(&info.workflow_id)
        .bind(&info.run_id)
        .bind(request.condition)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let stored: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT next_event_id FROM executions
                WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
                "#,
            )
            .bind(&info.domain_id)
            .bind(&info.workflow_id)
            .bind(&info.run_id)
            .fetch_optional(&mut *tx)
            .await?;
            return Err(match stored {
                Some(next_event_id) => CoreError::ConditionFailed {
                    operation: "update_workflow_execution".to_string(),
                    details: format!(
                        "expected next_event_id {}, store has {next_event_id}",
                        request.condition
                    ),
                },
                None => CoreError::ExecutionNotFound {
                    workflow_id: info.workflow_id.clone(),
                    run_id: info.run_id.clone(),
                },
            });
        }

        if request.clear_decision || request.decision.is_some() {
            let decision_blob = match &request.decision {
                Some(decision) => Some(serde_json::to_vec(decision)?),
                None => None,
            };
            sqlx::query(
                r#"
                UPDATE executions SET decision = ?
                WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
                "#,
            )
            .bind(decision_blob)
            .bind(&info.domain_id)
            .bind(&info.workflow_id)
            .bind(&info.run_id)
            .execute(&mut *tx)
            .await?;
        }

        for activity in &request.upsert_activity_infos {
            sqlx::query(
                r#"
                INSERT INTO activity_infos (domain_id, workflow_id, run_id, schedule_id, data)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (domain_id, workflow_id, run_id, schedule_id)
                DO UPDATE SET data = excluded.data
                "#,
            )
            .bind(&info.domain_id)
            .bind(&info.workflow_id)
            .bind(&info.run_id)
            .bind(activity.schedule_id)
            .bind(serde_json::to_vec(activity)?)
            .execute(&mut *tx)
            .await?;
        }
        for schedule_id in &request.delete_activity_infos {
            sqlx::query(
                r#"
                DELETE FROM activity_infos
                WHERE domain_id = ? AND workflow_id = ? AND run_id = ? AND schedule_id = ?
                "#,
            )
            .bind(&info.domain_id)
            .bind(&info.workflow_id)
            .bind(&info.run_id)
            .bind(schedule_id)
            .execute(&mut *tx)
            .await?;
        }
        for timer in &request.upsert_timer_infos {
            sqlx::query(
                r#"
                INSERT INTO timer_infos (domain_id, workflow_id, run_id, timer_id, data)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (domain_id, workflow_id, run_id, timer_id)
                DO UPDATE SET data = excluded.data
                "#,
            )
            .bind(&info.domain_id)
            .bind(&info.workflow_id)
            .bind(&info.run_id)
            .bind(&timer.timer_id)
            .bind(serde_json::to_vec(timer)?)
            .execute(&mut *tx)
            .await?;
        }
        for timer_id in &request.delete_timer_infos {
            sqlx::query(
                r#"
                DELETE FROM timer_infos
                WHERE domain_id = ? AND workflow_id = ? AND run_id = ? AND timer_id = ?
                "#,
            )
            .bind(&info.domain_id)
            .bind(&info.workflow_id)
            .bind(&info.run_id)
            .bind(timer_id)
            .execute(&mut *tx)
            .await?;
        }

        self.insert_shard_tasks(
            &mut tx,
            request.shard_id,
            &request.transfer_tasks,
            &request.timer_tasks,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_timer_index_tasks(
        &self,
        shard_id: i32,
        min_visibility: DateTime<Utc>,
        max_visibility: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<TimerTaskInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM timer_tasks
            WHERE shard_id = ? AND visibility_ms >= ? AND visibility_ms < ?
            ORDER BY visibility_ms ASC, task_id ASC
            LIMIT ?
            "#,
        )
        .bind(shard_id)
        .bind(millis(min_visibility))
        .bind(millis(max_visibility))
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| decode_blob(row, "data")).collect()
    }

    async fn complete_timer_task(
        &self,
        shard_id: i32,
        visibility_time: DateTime<Utc>,
        task_id: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM timer_tasks
            WHERE shard_id = ? AND visibility_ms = ? AND task_id = ?
            "#,
        )
        .bind(shard_id)
        .bind(millis(visibility_time))
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_transfer_tasks(
        &self,
        shard_id: i32,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TransferTaskInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM transfer_tasks
            WHERE shard_id = ? AND task_id > ? AND task_id <= ?
            ORDER BY task_id ASC
            LIMIT ?
            "#,
        )
        .bind(shard_id)
        .bind(read_level)
        .bind(max_read_level)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| decode_blob(row, "data")).collect()
    }

    async fn complete_transfer_task(&self, shard_id: i32, task_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM transfer_tasks WHERE shard_id = ? AND task_id = ?")
            .bind(shard_id)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn state_to_str(state: crate::types::WorkflowState) -> &'static str {
    match state {
        crate::types::WorkflowState::Created => "created",
        crate::types::WorkflowState::Running => "running",
        crate::types::WorkflowState::Completed => "completed",
    }
}

fn state_from_str(value: &str) -> Result<crate::types::WorkflowState> {
    match value {
        "created" => Ok(crate::types::WorkflowState::Created),
        "running" => Ok(crate::types::WorkflowState::Running),
        "completed" => Ok(crate::types::WorkflowState::Completed),
        other => Err(CoreError::Database {
            operation: "decode".to_string(),
            details: format!("unknown workflow state '{other}'"),
        }),
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn lease_task_list(&self, id: &TaskListId) -> Result<TaskListInfo> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO task_lists (domain_id, name, task_type, range_id, ack_level)
            VALUES (?, ?, ?, 0, 0)
            "#,
        )
        .bind(&id.domain_id)
        .bind(&id.name)
        .bind(id.task_type.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE task_lists SET range_id = range_id + 1
            WHERE domain_id = ? AND name = ? AND task_type = ?
            "#,
        )
        .bind(&id.domain_id)
        .bind(&id.name)
        .bind(id.task_type.as_str())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT range_id, ack_level FROM task_lists
            WHERE domain_id = ? AND name = ? AND task_type = ?
            "#,
        )
        .bind(&id.domain_id)
        .bind(&id.name)
        .bind(id.task_type.as_str())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(TaskListInfo {
            domain_id: id.domain_id.clone(),
            name: id.name.clone(),
            task_type: id.task_type,
            range_id: row.try_get("range_id")?,
            ack_level: row.try_get("ack_level")?,
        })
    }

    async fn update_task_list(&self, info: TaskListInfo) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE task_lists SET ack_level = ?
            WHERE domain_id = ? AND name = ? AND task_type = ? AND range_id = ?
            "#,
        )
        .bind(info.ack_level)
        .bind(&info.domain_id)
        .bind(&info.name)
        .bind(info.task_type.as_str())
        .bind(info.range_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let id = TaskListId::new(info.domain_id, info.name, info.task_type);
            return Err(CoreError::TaskListOwnershipLost {
                task_list: id.to_string(),
                details: format!("update carried range_id {}", info.range_id),
            });
        }
        Ok(())
    }

    async fn create_tasks(
        &self,
        id: &TaskListId,
        tasks: Vec<TaskInfo>,
        range_id: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let stored: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT range_id FROM task_lists
            WHERE domain_id = ? AND name = ? AND task_type = ?
            "#,
        )
        .bind(&id.domain_id)
        .bind(&id.name)
        .bind(id.task_type.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        match stored {
            None => return Err(CoreError::NotFound(format!("task list {id}"))),
            Some(stored) if stored != range_id => {
                return Err(CoreError::ConditionFailed {
                    operation: "create_tasks".to_string(),
                    details: format!("carried range_id {range_id}, store has {stored}"),
                });
            }
            Some(_) => {}
        }

        for task in &tasks {
            sqlx::query(
                r#"
                INSERT INTO tasks (domain_id, name, task_type, task_id, data)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id.domain_id)
            .bind(&id.name)
            .bind(id.task_type.as_str())
            .bind(task.task_id)
            .bind(serde_json::to_vec(task)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_tasks(
        &self,
        id: &TaskListId,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TaskInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM tasks
            WHERE domain_id = ? AND name = ? AND task_type = ? AND task_id > ? AND task_id <= ?
            ORDER BY task_id ASC
            LIMIT ?
            "#,
        )
        .bind(&id.domain_id)
        .bind(&id.name)
        .bind(id.task_type.as_str())
        .bind(read_level)
        .bind(max_read_level)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| decode_blob(row, "data")).collect()
    }

    async fn complete_task(&self, id: &TaskListId, task_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE domain_id = ? AND name = ? AND task_type = ? AND task_id = ?
            "#,
        )
        .bind(&id.domain_id)
        .bind(&id.name)
        .bind(id.task_type.as_str())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn decode_page_token(token: &Option<Vec<u8>>) -> Result<i64> {
    match token {
        None => Ok(0),
        Some(bytes) => serde_json::from_slice::<i64>(bytes)
            .map_err(|_| CoreError::InvalidArgument("malformed page token".to_string())),
    }
}

#[async_trait]
impl VisibilityStore for SqliteStore {
    async fn record_workflow_execution_started(
        &self,
        request: RecordExecutionStartedRequest,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO open_executions
                (domain_id, workflow_id, run_id, workflow_type, start_ms)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.domain_id)
        .bind(&request.execution.workflow_id)
        .bind(&request.execution.run_id)
        .bind(&request.workflow_type)
        .bind(millis(request.start_time))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_workflow_execution_closed(
        &self,
        request: RecordExecutionClosedRequest,
    ) -> Result<()> {
        let retention = request
            .retention_seconds
            .unwrap_or(DEFAULT_CLOSE_TTL_SECONDS);
        let expiry = request.close_time + Duration::seconds(retention);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM open_executions WHERE domain_id = ? AND run_id = ?")
            .bind(&request.domain_id)
            .bind(&request.execution.run_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO closed_executions
                (domain_id, workflow_id, run_id, workflow_type, start_ms, close_ms, status, expiry_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.domain_id)
        .bind(&request.execution.workflow_id)
        .bind(&request.execution.run_id)
        .bind(&request.workflow_type)
        .bind(millis(request.start_time))
        .bind(millis(request.close_time))
        .bind(close_status_to_str(request.status))
        .bind(millis(expiry))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_open_workflow_executions(
        &self,
        request: ListExecutionsRequest,
    ) -> Result<ListExecutionsResponse> {
        let offset = decode_page_token(&request.next_page_token)?;
        let mut sql = String::from(
            "SELECT workflow_id, run_id, workflow_type, start_ms FROM open_executions \
             WHERE domain_id = ? AND start_ms >= ? AND start_ms <= ?",
        );
        match &request.filter {
            Some(VisibilityFilter::WorkflowType(_)) => sql.push_str(" AND workflow_type = ?"),
            Some(VisibilityFilter::WorkflowId(_)) => sql.push_str(" AND workflow_id = ?"),
            Some(VisibilityFilter::Status(_)) => {
                return Err(CoreError::InvalidArgument(
                    "status filter applies only to closed executions".to_string(),
                ));
            }
            None => {}
        }
        sql.push_str(" ORDER BY start_ms DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql)
            .bind(&request.domain_id)
            .bind(millis(request.earliest_start_time))
            .bind(millis(request.latest_start_time));
        query = match &request.filter {
            Some(VisibilityFilter::WorkflowType(name)) => query.bind(name),
            Some(VisibilityFilter::WorkflowId(id)) => query.bind(id),
            _ => query,
        };
        let rows = query
            .bind(request.page_size as i64)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let executions: Vec<WorkflowExecutionRecord> = rows
            .iter()
            .map(|row| {
                Ok(WorkflowExecutionRecord {
                    execution: WorkflowExecution {
                        workflow_id: row.try_get("workflow_id")?,
                        run_id: row.try_get("run_id")?,
                    },
                    workflow_type: row.try_get("workflow_type")?,
                    start_time: from_millis(row.try_get("start_ms")?),
                    close_time: None,
                    status: None,
                })
            })
            .collect::<Result<_>>()?;

        let next_page_token = if executions.len() == request.page_size {
            Some(serde_json::to_vec(&(offset + executions.len() as i64))?)
        } else {
            None
        };
        Ok(ListExecutionsResponse {
            executions,
            next_page_token,
        })
    }

    async fn list_closed_workflow_executions(
        &self,
        request: ListExecutionsRequest,
    ) -> Result<ListExecutionsResponse> {
        let offset = decode_page_token(&request.next_page_token)?;
        let mut sql = String::from(
            "SELECT workflow_id, run_id, workflow_type, start_ms, close_ms, status \
             FROM closed_executions \
             WHERE domain_id = ? AND start_ms >= ? AND start_ms <= ? AND expiry_ms > ?",
        );
        match &request.filter {
            Some(VisibilityFilter::WorkflowType(_)) => sql.push_str(" AND workflow_type = ?"),
            Some(VisibilityFilter::WorkflowId(_)) => sql.push_str(" AND workflow_id = ?"),
            Some(VisibilityFilter::Status(_)) => sql.push_str(" AND status = ?"),
            None => {}
        }
        sql.push_str(" ORDER BY start_ms DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql)
            .bind(&request.domain_id)
            .bind(millis(request.earliest_start_time))
            .bind(millis(request.latest_start_time))
            .bind(millis(Utc::now()));
        query = match &request.filter {
            Some(VisibilityFilter::WorkflowType(name)) => query.bind(name),
            Some(VisibilityFilter::WorkflowId(id)) => query.bind(id),
            Some(VisibilityFilter::Status(status)) => query.bind(close_status_to_str(*status)),
            None => query,
        };
        let rows = query
            .bind(request.page_size as i64)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let executions: Vec<WorkflowExecutionRecord> = rows
            .iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(WorkflowExecutionRecord {
                    execution: WorkflowExecution {
                        workflow_id: row.try_get("workflow_id")?,
                        run_id: row.try_get("run_id")?,
                    },
                    workflow_type: row.try_get("workflow_type")?,
                    start_time: from_millis(row.try_get("start_ms")?),
                    close_time: Some(from_millis(row.try_get("close_ms")?)),
                    status: Some(close_status_from_str(&status)?),
                })
            })
            .collect::<Result<_>>()?;

        let next_page_token = if executions.len() == request.page_size {
            Some(serde_json::to_vec(&(offset + executions.len() as i64))?)
        } else {
            None
        };
        Ok(ListExecutionsResponse {
            executions,
            next_page_token,
        })
    }
}
