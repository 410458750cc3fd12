//! Error taxonomy for the task core.
//!
//! - `Validation`: bad input at creation, never retried automatically.
//! - `NotFound`: operation on a task id that does not exist.
//! - `Conflict`: illegal state transition; nothing was mutated.
//! - `Store`: backend failure, surfaced as-is for the caller to retry.

use thiserror::Error;

use super::ids::TaskId;
use super::state::TaskStatus;

/// Input rejected before anything was written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failure reported by a `TaskStore` backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Connectivity, pool or query failure.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A persisted row could not be decoded into a domain value.
    #[error("corrupt task row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("cannot {action} task {id} in status {status}")]
    Conflict {
        id: TaskId,
        status: TaskStatus,
        action: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskError {
    pub fn is_validation(&self) -> bool {
        matches!(self, TaskError::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TaskError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, TaskError::Conflict { .. })
    }
}
