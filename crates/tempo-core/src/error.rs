// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types shared by every tempo crate.
//!
//! The taxonomy mirrors how callers are expected to react:
//!
//! | Class | Variants | Caller reaction |
//! |---|---|---|
//! | Transient | `ServiceBusy`, `ShuttingDown` | retry with backoff |
//! | Conditional failure | `ConditionFailed` | re-read state and retry within budget |
//! | Lost lease | `ShardOwnershipLost`, `TaskListOwnershipLost` | fatal to the owner |
//! | Existence | `ExecutionAlreadyStarted`, `ExecutionNotFound`, `NotFound` | surfaced verbatim |
//! | Invalid argument | `InvalidArgument` | rejected synchronously, never retried |
//! | Internal | `Database`, `Serialization` | logged with operation tag, returned |

use thiserror::Error;

/// Result type using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the tempo storage and service layers.
///
/// `Clone` because batched writers fan a single failure out to every waiter.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Too many outstanding appends on a task list; the caller must retry.
    #[error("service busy: task list '{task_list}' has too many outstanding appends")]
    ServiceBusy {
        /// Name of the saturated task list.
        task_list: String,
    },

    /// A conditional write did not match the stored version.
    #[error("condition failed during '{operation}': {details}")]
    ConditionFailed {
        /// The store operation that was attempted.
        operation: String,
        /// What the store observed.
        details: String,
    },

    /// The shard's range lease was taken over by another owner.
    #[error("shard {shard_id} ownership lost: {details}")]
    ShardOwnershipLost {
        /// Shard whose lease was lost.
        shard_id: i32,
        /// What the store observed.
        details: String,
    },

    /// The task list's range lease was taken over by another owner.
    #[error("task list '{task_list}' ownership lost: {details}")]
    TaskListOwnershipLost {
        /// Task list whose lease was lost.
        task_list: String,
        /// What the store observed.
        details: String,
    },

    /// A workflow with this id already has a running execution.
    #[error("workflow '{workflow_id}' already started with run id '{run_id}'")]
    ExecutionAlreadyStarted {
        /// The workflow id that collided.
        workflow_id: String,
        /// The run id of the execution already running.
        run_id: String,
    },

    /// The referenced workflow execution does not exist.
    #[error("workflow execution not found: workflow_id '{workflow_id}', run_id '{run_id}'")]
    ExecutionNotFound {
        /// The workflow id that was looked up.
        workflow_id: String,
        /// The run id that was looked up.
        run_id: String,
    },

    /// The referenced workflow execution already reached a terminal state.
    #[error("workflow execution already completed: workflow_id '{workflow_id}', run_id '{run_id}'")]
    ExecutionAlreadyCompleted {
        /// The workflow id that was addressed.
        workflow_id: String,
        /// The run id that was addressed.
        run_id: String,
    },

    /// A decision or activity task was already claimed by another worker.
    #[error("task already started: {task}")]
    TaskAlreadyStarted {
        /// Which task was claimed.
        task: String,
    },

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request is malformed and will never succeed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The component is shutting down and cannot accept the request.
    #[error("shutting down")]
    ShuttingDown,

    /// A storage operation failed.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Serializing or deserializing a payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Whether this error is a conditional-write failure that should be
    /// retried after re-reading state.
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, Self::ConditionFailed { .. })
    }

    /// Whether this error signals a lost range lease, fatal to the owner.
    pub fn is_ownership_lost(&self) -> bool {
        matches!(
            self,
            Self::ShardOwnershipLost { .. } | Self::TaskListOwnershipLost { .. }
        )
    }

    /// Whether the caller should retry after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ServiceBusy { .. } | Self::ShuttingDown)
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
