//! PostgreSQL-backed task store.
//!
//! Every mutating operation runs in one transaction: the row change and the
//! log rows that describe it commit together or not at all.
//!
//! ## Claiming
//!
//! `claim_next` is a single `UPDATE … WHERE id = (SELECT … FOR UPDATE SKIP
//! LOCKED) AND status = 'PENDING' RETURNING *`. Concurrent claimers skip rows
//! another transaction has locked instead of blocking on them, and the outer
//! status predicate makes a lost race return zero rows.
//!
//! ## Error mapping
//!
//! | Source | `StoreError` |
//! |--------|--------------|
//! | any `sqlx::Error` | `Backend` (operation name + driver message) |
//! | row that does not decode into a `Task`/`TaskLog` | `Corrupt` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::instrument;

use crate::domain::{
    LogDraft, LogLevel, Pagination, StoreError, Task, TaskFilter, TaskId, TaskLog, TaskPayload,
    TaskStatus, TaskType,
};
use crate::ports::{CasOutcome, TaskCounts, TaskStore};

const SCHEMA: &str = include_str!("../../migrations/0001_tasks.sql");

#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task, logs), fields(task_id = %task.id), err)]
    async fn insert(&self, task: Task, logs: Vec<LogDraft>) -> Result<Task, StoreError> {
        let body = task
            .payload
            .body()
            .map_err(|e| StoreError::Corrupt(format!("payload of {}: {e}", task.id)))?;

        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, task_type, status, priority, payload, result, error_message,
                retry_count, max_retries, scheduled_at, started_at, completed_at,
                claimed_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(task.id.as_ulid().to_string())
        .bind(task.task_type().as_str())
        .bind(task.status.as_str())
        .bind(i16::from(task.priority))
        .bind(&body)
        .bind(&task.result)
        .bind(&task.error_message)
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.max_retries))
        .bind(task.scheduled_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.claimed_by)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_task", e))?;

        insert_logs(&mut tx, task.id, logs, task.created_at).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(task)
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1")
            .bind(id.as_ulid().to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task", e))?;

        row.map(Task::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &TaskFilter, page: &Pagination) -> Result<Vec<Task>, StoreError> {
        // column and keyword come from closed enums, never from input text
        let sql = format!(
            r#"
            SELECT * FROM tasks
            WHERE ($1::text IS NULL OR task_type = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::smallint IS NULL OR priority >= $3)
            ORDER BY {} {} NULLS LAST, id ASC
            LIMIT $4 OFFSET $5
            "#,
            page.sort_by.column(),
            page.order.keyword(),
        );

        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(filter.task_type.map(TaskType::as_str))
            .bind(filter.status.map(TaskStatus::as_str))
            .bind(filter.min_priority.map(i16::from))
            .bind(bind_count(page.effective_limit()))
            .bind(bind_count(page.offset))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_tasks", e))?;

        rows.into_iter().map(Task::try_from).collect()
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn delete(&self, id: TaskId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id.as_ulid().to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_task", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, log), err)]
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        log: LogDraft,
    ) -> Result<Option<Task>, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET status = 'RUNNING', started_at = $1, claimed_by = $2, updated_at = $1
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'PENDING'
                  AND (scheduled_at IS NULL OR scheduled_at <= $1)
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'PENDING'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };
        let task = Task::try_from(row)?;

        insert_logs(&mut tx, task.id, vec![log], now).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(task))
    }

    #[instrument(
        skip(self, current, next, logs),
        fields(task_id = %current.id, from = %current.status, to = %next.status),
        err
    )]
    async fn compare_and_swap(
        &self,
        current: &Task,
        next: Task,
        logs: Vec<LogDraft>,
    ) -> Result<CasOutcome, StoreError> {
        if next.id != current.id {
            return Err(StoreError::Backend(format!(
                "cannot swap task {} with {}",
                current.id, next.id
            )));
        }
        let body = next
            .payload
            .body()
            .map_err(|e| StoreError::Corrupt(format!("payload of {}: {e}", next.id)))?;
        let id = current.id.as_ulid().to_string();

        let mut tx = self.begin().await?;

        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET status = $2, priority = $3, payload = $4, result = $5, error_message = $6,
                retry_count = $7, max_retries = $8, scheduled_at = $9, started_at = $10,
                completed_at = $11, claimed_by = $12, updated_at = $13
            WHERE id = $1
              AND status = $14
              AND started_at IS NOT DISTINCT FROM $15::timestamptz
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(next.status.as_str())
        .bind(i16::from(next.priority))
        .bind(&body)
        .bind(&next.result)
        .bind(&next.error_message)
        .bind(i64::from(next.retry_count))
        .bind(i64::from(next.max_retries))
        .bind(next.scheduled_at)
        .bind(next.started_at)
        .bind(next.completed_at)
        .bind(&next.claimed_by)
        .bind(next.updated_at)
        .bind(current.status.as_str())
        .bind(current.started_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("compare_and_swap", e))?;

        let Some(row) = row else {
            let actual: Option<String> =
                sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1")
                    .bind(&id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("compare_and_swap", e))?;
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;

            return match actual {
                None => Ok(CasOutcome::Missing),
                Some(status) => Ok(CasOutcome::Stale(parse_status(&status)?)),
            };
        };
        let stored = Task::try_from(row)?;

        insert_logs(&mut tx, stored.id, logs, stored.updated_at).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(CasOutcome::Swapped(stored))
    }

    #[instrument(skip(self, log), fields(task_id = %task_id), err)]
    async fn append_log(
        &self,
        task_id: TaskId,
        log: LogDraft,
        at: DateTime<Utc>,
    ) -> Result<Option<TaskLog>, StoreError> {
        let entry = log.bind(task_id, at);

        let result = sqlx::query(
            r#"
            INSERT INTO task_logs (id, task_id, level, message, metadata, created_at)
            SELECT $1, $2, $3, $4, $5, $6
            WHERE EXISTS (SELECT 1 FROM tasks WHERE id = $2)
            "#,
        )
        .bind(entry.id.as_ulid().to_string())
        .bind(task_id.as_ulid().to_string())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_log", e))?;

        Ok((result.rows_affected() > 0).then_some(entry))
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn list_logs(&self, task_id: TaskId) -> Result<Vec<TaskLog>, StoreError> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT id, task_id, level, message, metadata, created_at
            FROM task_logs
            WHERE task_id = $1
            ORDER BY created_at ASC, seq ASC
            "#,
        )
        .bind(task_id.as_ulid().to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_logs", e))?;

        rows.into_iter().map(TaskLog::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_stale_running(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM tasks
            WHERE status = 'RUNNING' AND started_at < $1
            ORDER BY started_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(started_before)
        .bind(bind_count(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stale_running", e))?;

        rows.into_iter().map(Task::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn counts_by_status(&self) -> Result<TaskCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("counts_by_status", e))?;

        let mut counts = TaskCounts::default();
        for (status, n) in rows {
            counts.add(parse_status(&status)?, usize::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}

async fn insert_logs(
    tx: &mut Transaction<'static, Postgres>,
    task_id: TaskId,
    logs: Vec<LogDraft>,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    for draft in logs {
        let entry = draft.bind(task_id, at);
        sqlx::query(
            r#"
            INSERT INTO task_logs (id, task_id, level, message, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id.as_ulid().to_string())
        .bind(task_id.as_ulid().to_string())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_log", e))?;
    }
    Ok(())
}

/// LIMIT/OFFSET argument; saturates instead of wrapping.
fn bind_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Backend(format!(
            "database error in {operation}: {} (code {})",
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none"),
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Backend(format!("connection pool timed out in {operation}"))
        }
        decode @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_)) => {
            StoreError::Corrupt(format!("{operation}: {decode}"))
        }
        other => StoreError::Backend(format!("{operation}: {other}")),
    }
}

fn parse_status(raw: &str) -> Result<TaskStatus, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown status '{raw}'")))
}

// ========================================
// Row types
// ========================================

#[derive(Debug, FromRow)]
struct TaskRow {
    id: String,
    task_type: String,
    status: String,
    priority: i16,
    payload: serde_json::Value,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    retry_count: i64,
    max_retries: i64,
    scheduled_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let id: TaskId = row
            .id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?;
        let corrupt = |what: &str| StoreError::Corrupt(format!("task {id}: {what}"));

        let task_type: TaskType = row
            .task_type
            .parse()
            .map_err(|_| corrupt(&format!("unknown type '{}'", row.task_type)))?;
        // stored without the tag; rebuild the adjacently tagged form
        let payload: TaskPayload = serde_json::from_value(serde_json::json!({
            "type": task_type.as_str(),
            "payload": row.payload,
        }))
        .map_err(|e| corrupt(&format!("payload: {e}")))?;

        Ok(Task {
            id,
            payload,
            status: parse_status(&row.status)?,
            priority: u8::try_from(row.priority).map_err(|_| corrupt("priority out of range"))?,
            result: row.result,
            error_message: row.error_message,
            retry_count: u32::try_from(row.retry_count)
                .map_err(|_| corrupt("retry_count out of range"))?,
            max_retries: u32::try_from(row.max_retries)
                .map_err(|_| corrupt("max_retries out of range"))?,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            claimed_by: row.claimed_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct LogRow {
    id: String,
    task_id: String,
    level: String,
    message: String,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for TaskLog {
    type Error = StoreError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        let level: LogLevel = row.level.parse().map_err(StoreError::Corrupt)?;
        Ok(TaskLog {
            id: row.id.parse().map_err(|e| StoreError::Corrupt(format!("{e}")))?,
            task_id: row.task_id.parse().map_err(|e| StoreError::Corrupt(format!("{e}")))?,
            level,
            message: row.message,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use ulid::Ulid;

    fn row() -> TaskRow {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        TaskRow {
            id: Ulid::new().to_string(),
            task_type: "GENERATE_SUMMARY".to_string(),
            status: "PENDING".to_string(),
            priority: 7,
            payload: json!({"paperId": "p-1", "maxWords": 200}),
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            claimed_by: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn row_decodes_into_task() {
        let task = Task::try_from(row()).unwrap();
        assert_eq!(task.task_type(), TaskType::GenerateSummary);
        assert_eq!(task.priority, 7);
        assert_eq!(task.payload.body().unwrap(), json!({"paperId": "p-1", "maxWords": 200}));
    }

    #[test]
    fn bad_rows_are_corrupt() {
        let mut bad_status = row();
        bad_status.status = "PAUSED".to_string();
        assert!(matches!(Task::try_from(bad_status), Err(StoreError::Corrupt(_))));

        let mut bad_payload = row();
        bad_payload.payload = json!({"url": "https://x"});
        assert!(matches!(Task::try_from(bad_payload), Err(StoreError::Corrupt(_))));

        let mut bad_retries = row();
        bad_retries.retry_count = -1;
        assert!(matches!(Task::try_from(bad_retries), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn huge_offsets_saturate() {
        assert_eq!(bind_count(40), 40);
        assert_eq!(bind_count(usize::MAX), i64::MAX);
    }
}
