//! LifecycleManager: the only writer of task state transitions.
//!
//! Every mutation is one `compare_and_swap` against the version the manager
//! just read, carrying the log rows that describe it. A report that lost a
//! race (another report, or the reaper) gets `Conflict` and writes nothing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::domain::{
    Decider, Decision, LogDraft, LogLevel, NewTask, Outcome, Task, TaskError, TaskId, TaskStatus,
};
use crate::ports::{CasOutcome, Clock, IdGenerator, TaskStore};

pub struct LifecycleManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    decider: Arc<dyn Decider>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        decider: Arc<dyn Decider>,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            decider,
        }
    }

    /// Validate and persist a new PENDING task with its "task created" log.
    pub async fn create(&self, input: NewTask) -> Result<Task, TaskError> {
        let validated = input.validate()?;
        let now = self.clock.now();
        let task = validated.into_task(self.ids.generate_task_id(), now);

        let log = LogDraft::transition(
            self.ids.generate_log_id(),
            LogLevel::Info,
            None,
            TaskStatus::Pending,
            "task created",
        )
        .with_metadata(json!({
            "type": task.task_type().as_str(),
            "priority": task.priority,
            "maxRetries": task.max_retries,
        }));

        let task = self.store.insert(task, vec![log]).await?;
        info!(
            task_id = %task.id,
            task_type = %task.task_type(),
            priority = task.priority,
            "task created"
        );
        Ok(task)
    }

    /// Apply a report to whatever claim currently holds the task.
    ///
    /// Workers should prefer `report_outcome_for`, which is tied to their own
    /// claim.
    pub async fn report_outcome(&self, id: TaskId, outcome: Outcome) -> Result<Task, TaskError> {
        let current = self.store.get(id).await?.ok_or(TaskError::NotFound(id))?;
        self.apply(&current, outcome).await
    }

    /// Apply a report to the claim that returned `claimed`.
    ///
    /// If the task was reaped and claimed again since, the stored
    /// `started_at` no longer matches and the report gets `Conflict`.
    pub async fn report_outcome_for(
        &self,
        claimed: &Task,
        outcome: Outcome,
    ) -> Result<Task, TaskError> {
        self.apply(claimed, outcome).await
    }

    async fn apply(&self, current: &Task, outcome: Outcome) -> Result<Task, TaskError> {
        match outcome {
            Outcome::Success { result } => self.complete(current, result).await,
            Outcome::Failure { error_message } => {
                self.fail(current, &error_message, Vec::new()).await
            }
        }
    }

    async fn complete(
        &self,
        current: &Task,
        result: Option<serde_json::Value>,
    ) -> Result<Task, TaskError> {
        ensure_edge(current, TaskStatus::Completed, "complete")?;
        let now = self.clock.now();

        let mut next = current.clone();
        next.status = TaskStatus::Completed;
        next.result = result;
        next.error_message = None;
        next.completed_at = Some(now);
        next.updated_at = now;

        let log = LogDraft::transition(
            self.ids.generate_log_id(),
            LogLevel::Info,
            Some(TaskStatus::Running),
            TaskStatus::Completed,
            "task completed",
        );

        let task = self.swap(current, next, vec![log], "complete").await?;
        info!(task_id = %task.id, retry_count = task.retry_count, "task completed");
        Ok(task)
    }

    /// Fail a RUNNING task and let the decider choose between re-queue and
    /// terminal FAILED. `logs` are written before the transition rows.
    pub(crate) async fn fail(
        &self,
        current: &Task,
        error_message: &str,
        mut logs: Vec<LogDraft>,
    ) -> Result<Task, TaskError> {
        ensure_edge(current, TaskStatus::Failed, "fail")?;
        let now = self.clock.now();
        let decision = self.decider.decide(current, error_message);

        let mut next = current.clone();
        next.error_message = Some(error_message.to_string());
        next.result = None;
        next.updated_at = now;

        let failed = LogDraft::transition(
            self.ids.generate_log_id(),
            LogLevel::Error,
            Some(TaskStatus::Running),
            TaskStatus::Failed,
            format!("task failed: {error_message}"),
        )
        .with_metadata(json!({
            "error": error_message,
            "retryCount": current.retry_count,
            "maxRetries": current.max_retries,
        }));

        match &decision {
            Decision::Requeue {
                retry_count,
                delay,
                reason,
            } => {
                let scheduled_at = scheduled_after(now, *delay);
                next.status = TaskStatus::Pending;
                next.retry_count = *retry_count;
                next.scheduled_at = Some(scheduled_at);
                next.started_at = None;
                next.completed_at = None;

                logs.push(failed);
                logs.push(
                    LogDraft::transition(
                        self.ids.generate_log_id(),
                        LogLevel::Warn,
                        Some(TaskStatus::Failed),
                        TaskStatus::Pending,
                        format!("task re-queued: {reason}"),
                    )
                    .with_metadata(json!({
                        "retryCount": retry_count,
                        "delayMs": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "scheduledAt": scheduled_at,
                    })),
                );
            }
            Decision::GiveUp { reason } => {
                next.status = TaskStatus::Failed;
                next.completed_at = Some(now);
                logs.push(failed.with_metadata(json!({ "reason": reason })));
            }
        }

        let task = self.swap(current, next, logs, "fail").await?;
        match decision {
            Decision::Requeue { delay, .. } => warn!(
                task_id = %task.id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = error_message,
                "task failed, re-queued"
            ),
            Decision::GiveUp { reason } => warn!(
                task_id = %task.id,
                retry_count = task.retry_count,
                error = error_message,
                reason = %reason,
                "task failed permanently"
            ),
        }
        Ok(task)
    }

    async fn swap(
        &self,
        current: &Task,
        next: Task,
        logs: Vec<LogDraft>,
        action: &'static str,
    ) -> Result<Task, TaskError> {
        match self.store.compare_and_swap(current, next, logs).await? {
            CasOutcome::Swapped(task) => Ok(task),
            CasOutcome::Missing => Err(TaskError::NotFound(current.id)),
            CasOutcome::Stale(status) => {
                debug!(task_id = %current.id, status = %status, action, "lost transition race");
                Err(TaskError::Conflict {
                    id: current.id,
                    status,
                    action,
                })
            }
        }
    }
}

fn ensure_edge(current: &Task, to: TaskStatus, action: &'static str) -> Result<(), TaskError> {
    if current.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(TaskError::Conflict {
            id: current.id,
            status: current.status,
            action,
        })
    }
}

/// `now + delay`, saturating, at store precision.
fn scheduled_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
        .trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::{Fixture, crawl};
    use crate::domain::{RetryPolicy, TaskType};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    #[tokio::test]
    async fn create_applies_defaults_and_logs() {
        let fx = Fixture::new();
        let task = fx.lifecycle.create(crawl()).await.unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 5);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.created_at, fx.t0);

        let logs = fx.store.list_logs(task.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "task created");
        assert_eq!(logs[0].metadata.as_ref().unwrap()["to"], "PENDING");
    }

    #[tokio::test]
    async fn create_rejects_bad_priority_without_writing() {
        let fx = Fixture::new();
        let err = fx
            .lifecycle
            .create(crawl().with_priority(15))
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert_eq!(err.to_string(), "priority must be between 1 and 10");
        assert_eq!(fx.store.counts_by_status().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn success_completes_and_stores_result() {
        let fx = Fixture::new();
        let task = fx.lifecycle.create(crawl()).await.unwrap();
        fx.dispatcher.claim_next("w-1").await.unwrap().unwrap();
        fx.clock.advance(ChronoDuration::seconds(3));

        let done = fx
            .lifecycle
            .report_outcome(task.id, Outcome::success_with(json!({"pages": 12})))
            .await
            .unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!({"pages": 12})));
        assert_eq!(done.completed_at, Some(fx.t0 + ChronoDuration::seconds(3)));
        assert!(done.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn failure_with_retries_left_requeues_with_backoff() {
        let fx = Fixture::new();
        let task = fx.lifecycle.create(crawl()).await.unwrap();
        fx.dispatcher.claim_next("w-1").await.unwrap().unwrap();

        let requeued = fx
            .lifecycle
            .report_outcome(task.id, Outcome::failure("connection reset"))
            .await
            .unwrap();

        let delay = RetryPolicy::default().backoff(1);
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.started_at, None);
        assert_eq!(requeued.completed_at, None);
        assert_eq!(
            requeued.scheduled_at,
            Some(fx.t0 + TimeDelta::from_std(delay).unwrap())
        );
        assert_eq!(requeued.error_message.as_deref(), Some("connection reset"));

        // created, claimed, failed, re-queued
        let logs = fx.store.list_logs(task.id).await.unwrap();
        let levels: Vec<LogLevel> = logs.iter().map(|l| l.level).collect();
        assert_eq!(
            levels,
            vec![LogLevel::Info, LogLevel::Info, LogLevel::Error, LogLevel::Warn]
        );
        assert_eq!(logs[3].metadata.as_ref().unwrap()["to"], "PENDING");
    }

    #[tokio::test]
    async fn requeued_task_waits_for_backoff() {
        let fx = Fixture::new();
        let task = fx.lifecycle.create(crawl()).await.unwrap();
        fx.dispatcher.claim_next("w-1").await.unwrap();
        fx.lifecycle
            .report_outcome(task.id, Outcome::failure("boom"))
            .await
            .unwrap();

        assert!(fx.dispatcher.claim_next("w-1").await.unwrap().is_none());

        fx.clock.advance(ChronoDuration::seconds(4));
        let again = fx.dispatcher.claim_next("w-1").await.unwrap().unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(again.retry_count, 1);
    }

    #[tokio::test]
    async fn exhausting_retries_fails_terminally() {
        let fx = Fixture::new();
        let task = fx
            .lifecycle
            .create(crawl().with_max_retries(2))
            .await
            .unwrap();

        let mut last = task.clone();
        for _ in 0..3 {
            fx.dispatcher.claim_next("w-1").await.unwrap().unwrap();
            last = fx
                .lifecycle
                .report_outcome(task.id, Outcome::failure("still broken"))
                .await
                .unwrap();
            fx.clock.advance(ChronoDuration::minutes(10));
        }

        assert_eq!(last.status, TaskStatus::Failed);
        assert_eq!(last.retry_count, 2);
        assert!(last.completed_at.is_some());
        assert!(last.check_invariants().is_ok());
        assert!(fx.dispatcher.claim_next("w-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_max_retries_fails_on_first_error() {
        let fx = Fixture::new();
        let task = fx
            .lifecycle
            .create(crawl().with_max_retries(0))
            .await
            .unwrap();
        fx.dispatcher.claim_next("w-1").await.unwrap();

        let failed = fx
            .lifecycle
            .report_outcome(task.id, Outcome::failure("nope"))
            .await
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 0);
    }

    #[tokio::test]
    async fn reporting_on_pending_task_conflicts() {
        let fx = Fixture::new();
        let task = fx.lifecycle.create(crawl()).await.unwrap();

        let err = fx
            .lifecycle
            .report_outcome(task.id, Outcome::success())
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let stored = fx.store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored, task);
        assert_eq!(fx.store.list_logs(task.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_report_conflicts() {
        let fx = Fixture::new();
        let task = fx.lifecycle.create(crawl()).await.unwrap();
        fx.dispatcher.claim_next("w-1").await.unwrap();

        fx.lifecycle
            .report_outcome(task.id, Outcome::success())
            .await
            .unwrap();
        let err = fx
            .lifecycle
            .report_outcome(task.id, Outcome::failure("late"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TaskError::Conflict {
                status: TaskStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let fx = Fixture::new();
        let task = fx.lifecycle.create(crawl()).await.unwrap();
        let first = fx.dispatcher.claim_next("w-1").await.unwrap().unwrap();

        fx.lifecycle
            .report_outcome(task.id, Outcome::failure("boom"))
            .await
            .unwrap();
        fx.clock.advance(ChronoDuration::minutes(1));
        fx.dispatcher.claim_next("w-2").await.unwrap().unwrap();

        // the first claim's copy is RUNNING too, but from an older claim
        let err = fx.lifecycle.fail(&first, "late", Vec::new()).await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::Conflict {
                status: TaskStatus::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn report_for_reclaimed_task_conflicts() {
        let fx = Fixture::new();
        fx.lifecycle.create(crawl()).await.unwrap();
        let first = fx.dispatcher.claim_next("w-1").await.unwrap().unwrap();

        fx.lifecycle
            .report_outcome_for(&first, Outcome::failure("boom"))
            .await
            .unwrap();
        fx.clock.advance(ChronoDuration::minutes(1));
        let second = fx.dispatcher.claim_next("w-2").await.unwrap().unwrap();

        let err = fx
            .lifecycle
            .report_outcome_for(&first, Outcome::success())
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let done = fx
            .lifecycle
            .report_outcome_for(&second, Outcome::success())
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.claimed_by.as_deref(), Some("w-2"));
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let fx = Fixture::new();
        let id = fx.ids.generate_task_id();
        let err = fx
            .lifecycle
            .report_outcome(id, Outcome::success())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn payload_type_survives_round_trip() {
        let fx = Fixture::new();
        let input = NewTask::new(
            TaskType::GenerateSummary,
            json!({"paperId": "paper-42", "maxWords": 150}),
        );
        let task = fx.lifecycle.create(input).await.unwrap();
        let stored = fx.store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.task_type(), TaskType::GenerateSummary);
    }

    #[test]
    fn scheduled_after_saturates() {
        let now = Utc::now();
        assert_eq!(
            scheduled_after(now, Duration::MAX),
            DateTime::<Utc>::MAX_UTC.trunc_subsecs(6)
        );
    }
}
