//! AuditTrail: explicit annotations and per-task history reads.
//!
//! Transition rows are written by the lifecycle and dispatch paths as part of
//! their own store operation; this service covers everything else.

use std::sync::Arc;

use tracing::debug;

use crate::domain::{LogDraft, LogLevel, TaskError, TaskId, TaskLog};
use crate::ports::{Clock, IdGenerator, TaskStore};

pub struct AuditTrail {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl AuditTrail {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self { store, clock, ids }
    }

    pub async fn append(
        &self,
        task_id: TaskId,
        level: LogLevel,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<TaskLog, TaskError> {
        let mut draft = LogDraft::new(self.ids.generate_log_id(), level, message);
        if let Some(metadata) = metadata {
            draft = draft.with_metadata(metadata);
        }

        let entry = self
            .store
            .append_log(task_id, draft, self.clock.now())
            .await?
            .ok_or(TaskError::NotFound(task_id))?;
        debug!(task_id = %task_id, level = %entry.level, "log appended");
        Ok(entry)
    }

    /// History of one task, oldest first.
    pub async fn list_by_task(&self, task_id: TaskId) -> Result<Vec<TaskLog>, TaskError> {
        if self.store.get(task_id).await?.is_none() {
            return Err(TaskError::NotFound(task_id));
        }
        Ok(self.store.list_logs(task_id).await?)
    }
}
