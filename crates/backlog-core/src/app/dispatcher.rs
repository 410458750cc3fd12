//! Dispatcher: hands the next eligible task to a calling worker.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::domain::{LogDraft, LogLevel, Task, TaskError, TaskStatus, ValidationError};
use crate::ports::{Clock, IdGenerator, TaskStore};

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self { store, clock, ids }
    }

    /// Claim the best eligible task for `worker_id`, or `None` if nothing is
    /// eligible right now.
    ///
    /// Selection and the PENDING -> RUNNING write are one store operation,
    /// so concurrent callers never receive the same task.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, TaskError> {
        if worker_id.trim().is_empty() {
            return Err(ValidationError::new("workerId must not be empty").into());
        }

        let now = self.clock.now();
        let log = LogDraft::transition(
            self.ids.generate_log_id(),
            LogLevel::Info,
            Some(TaskStatus::Pending),
            TaskStatus::Running,
            format!("task claimed by {worker_id}"),
        )
        .with_metadata(json!({ "workerId": worker_id }));

        let claimed = self.store.claim_next(now, worker_id, log).await?;
        match &claimed {
            Some(task) => info!(
                task_id = %task.id,
                worker_id,
                task_type = %task.task_type(),
                priority = task.priority,
                retry_count = task.retry_count,
                "task claimed"
            ),
            None => debug!(worker_id, "no eligible task"),
        }
        Ok(claimed)
    }
}
