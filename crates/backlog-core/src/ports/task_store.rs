//! TaskStore port: the durable source of truth for tasks and their logs.
//!
//! The store knows nothing about the state machine. It offers CRUD, filtered
//! listing, and two conditional primitives the services build transitions
//! from:
//! - `claim_next`: pick-and-mark-running as one atomic step
//! - `compare_and_swap`: write a new version of a task only if the stored
//!   row still matches the version the caller read
//!
//! Log rows passed alongside a write are committed in the same atomic step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    LogDraft, Pagination, StoreError, Task, TaskFilter, TaskId, TaskLog, TaskStatus,
};

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The write happened; carries the stored task.
    Swapped(Task),

    /// No task with that id.
    Missing,

    /// The stored row moved on since it was read; carries its current status.
    Stale(TaskStatus),
}

/// Per-status totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn add(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task together with its creation logs (stamped `task.created_at`).
    async fn insert(&self, task: Task, logs: Vec<LogDraft>) -> Result<Task, StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    async fn list(&self, filter: &TaskFilter, page: &Pagination) -> Result<Vec<Task>, StoreError>;

    /// Remove a task and, by cascade, its logs. `false` when it did not exist.
    async fn delete(&self, id: TaskId) -> Result<bool, StoreError>;

    /// Atomically pick the best eligible task and mark it RUNNING.
    ///
    /// Eligible: PENDING and `scheduled_at` unset or `<= now`.
    /// Best: highest priority, then oldest `created_at`, then lowest id.
    /// The chosen task gets `started_at = now`, `claimed_by = worker_id`,
    /// `updated_at = now`, and `log` bound to it at `now`.
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        log: LogDraft,
    ) -> Result<Option<Task>, StoreError>;

    /// Replace `current` with `next` if the stored row still has
    /// `current.status` and `current.started_at`. Logs are stamped `next.updated_at`.
    async fn compare_and_swap(
        &self,
        current: &Task,
        next: Task,
        logs: Vec<LogDraft>,
    ) -> Result<CasOutcome, StoreError>;

    /// Append a log row. `None` when the task does not exist.
    async fn append_log(
        &self,
        task_id: TaskId,
        log: LogDraft,
        at: DateTime<Utc>,
    ) -> Result<Option<TaskLog>, StoreError>;

    /// Logs of a task in `created_at` order (insertion order on ties).
    async fn list_logs(&self, task_id: TaskId) -> Result<Vec<TaskLog>, StoreError>;

    /// RUNNING tasks claimed before `started_before`, oldest claim first.
    async fn list_stale_running(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    async fn counts_by_status(&self) -> Result<TaskCounts, StoreError>;
}
