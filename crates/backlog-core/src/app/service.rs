//! TaskService: the public surface of the task core.
//!
//! Wires one store, clock and id generator into the lifecycle, dispatch,
//! audit and reaper services and exposes their operations together.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::audit::AuditTrail;
use super::dispatcher::Dispatcher;
use super::lifecycle::LifecycleManager;
use super::reaper::{DEFAULT_STALE_AFTER, Reaper};
use crate::domain::{
    Decider, DefaultDecider, LogLevel, NewTask, Outcome, Pagination, RetryPolicy, Task,
    TaskError, TaskFilter, TaskId, TaskLog,
};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskCounts, TaskStore, UlidGenerator};

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    lifecycle: Arc<LifecycleManager>,
    dispatcher: Dispatcher,
    audit: AuditTrail,
    reaper: Arc<Reaper>,
}

impl TaskService {
    pub fn builder(store: Arc<dyn TaskStore>) -> TaskServiceBuilder {
        TaskServiceBuilder::new(store)
    }

    /// Service with the default retry policy and reaper threshold.
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self::builder(store).clock(clock).id_generator(ids).build()
    }

    pub async fn create_task(&self, input: NewTask) -> Result<Task, TaskError> {
        self.lifecycle.create(input).await
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task, TaskError> {
        self.store.get(id).await?.ok_or(TaskError::NotFound(id))
    }

    pub async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: &Pagination,
    ) -> Result<Vec<Task>, TaskError> {
        Ok(self.store.list(filter, page).await?)
    }

    /// Remove a task and its logs.
    pub async fn delete_task(&self, id: TaskId) -> Result<(), TaskError> {
        if !self.store.delete(id).await? {
            return Err(TaskError::NotFound(id));
        }
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, TaskError> {
        self.dispatcher.claim_next(worker_id).await
    }

    pub async fn report_outcome(&self, id: TaskId, outcome: Outcome) -> Result<Task, TaskError> {
        self.lifecycle.report_outcome(id, outcome).await
    }

    /// Report for the claim that returned `claimed`; a newer claim of the
    /// same task is left untouched.
    pub async fn report_outcome_for(
        &self,
        claimed: &Task,
        outcome: Outcome,
    ) -> Result<Task, TaskError> {
        self.lifecycle.report_outcome_for(claimed, outcome).await
    }

    pub async fn list_logs(&self, task_id: TaskId) -> Result<Vec<TaskLog>, TaskError> {
        self.audit.list_by_task(task_id).await
    }

    pub async fn append_log(
        &self,
        task_id: TaskId,
        level: LogLevel,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<TaskLog, TaskError> {
        self.audit.append(task_id, level, message, metadata).await
    }

    pub async fn counts(&self) -> Result<TaskCounts, TaskError> {
        Ok(self.store.counts_by_status().await?)
    }

    /// One reaper sweep; returns the number of stale tasks failed.
    pub async fn reap_stale(&self) -> Result<usize, TaskError> {
        self.reaper.sweep_once().await
    }

    /// Shared reaper, e.g. to `spawn` it as a background loop.
    pub fn reaper(&self) -> Arc<Reaper> {
        Arc::clone(&self.reaper)
    }
}

pub struct TaskServiceBuilder {
    store: Arc<dyn TaskStore>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
    stale_after: Duration,
}

impl TaskServiceBuilder {
    fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            clock: None,
            ids: None,
            decider: None,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn retry_policy(self, policy: RetryPolicy) -> Self {
        self.decider(Arc::new(DefaultDecider::new(policy)))
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Missing pieces default to the system clock, ULIDs stamped by that
    /// clock, and `DefaultDecider`.
    pub fn build(self) -> TaskService {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let ids = self.ids.unwrap_or_else(|| {
            Arc::new(UlidGenerator::new(Arc::clone(&clock))) as Arc<dyn IdGenerator>
        });
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::default()) as Arc<dyn Decider>);

        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&self.store),
            Arc::clone(&clock),
            Arc::clone(&ids),
            decider,
        ));
        let dispatcher =
            Dispatcher::new(Arc::clone(&self.store), Arc::clone(&clock), Arc::clone(&ids));
        let audit = AuditTrail::new(Arc::clone(&self.store), Arc::clone(&clock), Arc::clone(&ids));
        let reaper = Arc::new(Reaper::new(
            Arc::clone(&self.store),
            clock,
            ids,
            Arc::clone(&lifecycle),
            self.stale_after,
        ));

        TaskService {
            store: self.store,
            lifecycle,
            dispatcher,
            audit,
            reaper,
        }
    }
}
