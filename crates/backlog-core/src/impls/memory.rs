//! In-memory task store.
//!
//! All state sits behind one `tokio::sync::Mutex`, so every trait method is
//! atomic with respect to the others; in particular `claim_next` selects and
//! mutates under the same guard and two callers can never get the same task.

use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    LogDraft, Pagination, StoreError, Task, TaskFilter, TaskId, TaskLog, TaskStatus,
};
use crate::ports::{CasOutcome, TaskCounts, TaskStore};

/// Dispatch ordering key: higher priority first, then older, then lower id.
///
/// `Ord` is arranged so the best candidate is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClaimKey {
    priority: u8,
    created_at: Reverse<DateTime<Utc>>,
    id: Reverse<TaskId>,
}

impl ClaimKey {
    fn of(task: &Task) -> Self {
        Self {
            priority: task.priority,
            created_at: Reverse(task.created_at),
            id: Reverse(task.id),
        }
    }
}

impl PartialOrd for ClaimKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClaimKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Default)]
struct InMemoryState {
    /// All task records (single source of truth).
    tasks: HashMap<TaskId, Task>,

    /// Logs per task, in insertion order.
    logs: HashMap<TaskId, Vec<TaskLog>>,
}

impl InMemoryState {
    fn push_logs(&mut self, task_id: TaskId, drafts: Vec<LogDraft>, at: DateTime<Utc>) {
        let entries = self.logs.entry(task_id).or_default();
        entries.extend(drafts.into_iter().map(|d| d.bind(task_id, at)));
    }
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: Task, logs: Vec<LogDraft>) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::Backend(format!("duplicate task id {}", task.id)));
        }
        state.push_logs(task.id, logs, task.created_at);
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&id).cloned())
    }

    async fn list(&self, filter: &TaskFilter, page: &Pagination) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut matched: Vec<&Task> = state.tasks.values().filter(|t| filter.matches(t)).collect();
        matched.sort_by(|a, b| page.compare(a, b));

        Ok(matched
            .into_iter()
            .skip(page.offset)
            .take(page.effective_limit())
            .cloned()
            .collect())
    }

    async fn delete(&self, id: TaskId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let existed = state.tasks.remove(&id).is_some();
        state.logs.remove(&id);
        Ok(existed)
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        log: LogDraft,
    ) -> Result<Option<Task>, StoreError> {
        let mut state = self.state.lock().await;

        let Some(task_id) = state
            .tasks
            .values()
            .filter(|t| t.is_eligible(now))
            .max_by_key(|t| ClaimKey::of(t))
            .map(|t| t.id)
        else {
            return Ok(None);
        };

        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.claimed_by = Some(worker_id.to_string());
        task.updated_at = now;
        let claimed = task.clone();

        state.push_logs(task_id, vec![log], now);
        Ok(Some(claimed))
    }

    async fn compare_and_swap(
        &self,
        current: &Task,
        next: Task,
        logs: Vec<LogDraft>,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.state.lock().await;

        let Some(stored) = state.tasks.get_mut(&current.id) else {
            return Ok(CasOutcome::Missing);
        };
        if stored.status != current.status || stored.started_at != current.started_at {
            return Ok(CasOutcome::Stale(stored.status));
        }
        if next.id != current.id {
            return Err(StoreError::Backend(format!(
                "cannot swap task {} with {}",
                current.id, next.id
            )));
        }

        *stored = next.clone();
        state.push_logs(next.id, logs, next.updated_at);
        Ok(CasOutcome::Swapped(next))
    }

    async fn append_log(
        &self,
        task_id: TaskId,
        log: LogDraft,
        at: DateTime<Utc>,
    ) -> Result<Option<TaskLog>, StoreError> {
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(&task_id) {
            return Ok(None);
        }
        let entry = log.bind(task_id, at);
        state.logs.entry(task_id).or_default().push(entry.clone());
        Ok(Some(entry))
    }

    async fn list_logs(&self, task_id: TaskId) -> Result<Vec<TaskLog>, StoreError> {
        let state = self.state.lock().await;
        let mut logs = state.logs.get(&task_id).cloned().unwrap_or_default();
        // stable: insertion order survives on equal timestamps
        logs.sort_by_key(|l| l.created_at);
        Ok(logs)
    }

    async fn list_stale_running(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut stale: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running && t.started_at.is_some_and(|s| s < started_before)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|t| (t.started_at, t.id));
        stale.truncate(limit);
        Ok(stale)
    }

    async fn counts_by_status(&self) -> Result<TaskCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = TaskCounts::default();
        for task in state.tasks.values() {
            counts.add(task.status, 1);
        }
        Ok(counts)
    }
}
