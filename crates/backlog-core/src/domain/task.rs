//! Task record and creation input.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ValidationError;
use super::ids::TaskId;
use super::payload::TaskPayload;
use super::state::TaskStatus;
use super::task_type::TaskType;

pub const DEFAULT_PRIORITY: u8 = 5;
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A unit of deferred work.
///
/// This is the single source of truth for task state. Fields are public for
/// reading; only `LifecycleManager` and `Dispatcher` produce modified copies
/// and hand them to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,

    #[serde(flatten)]
    pub payload: TaskPayload,

    pub status: TaskStatus,

    /// 1..=10, 10 is most urgent.
    pub priority: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub retry_count: u32,
    pub max_retries: u32,

    /// Not eligible for claim before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Worker id of the most recent claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }

    /// PENDING and not scheduled after `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Checks the field invariants. Used by stores when decoding rows and by tests.
    pub fn check_invariants(&self) -> Result<(), String> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(format!("priority {} out of range", self.priority));
        }
        if self.retry_count > self.max_retries {
            return Err(format!(
                "retry_count {} exceeds max_retries {}",
                self.retry_count, self.max_retries
            ));
        }
        if self.status.is_finished() != self.completed_at.is_some() {
            return Err(format!(
                "completed_at must be set iff finished (status {})",
                self.status
            ));
        }
        if self.status == TaskStatus::Running && self.started_at.is_none() {
            return Err("running task without started_at".to_string());
        }
        if self.status == TaskStatus::Pending && self.started_at.is_some() {
            return Err("pending task with started_at".to_string());
        }
        Ok(())
    }
}

/// Producer input for `create_task`. Unvalidated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    #[serde(rename = "type")]
    pub task_type: String,

    #[serde(default)]
    pub priority: Option<i64>,

    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(default)]
    pub max_retries: Option<i64>,

    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(task_type: TaskType, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.as_str().to_string(),
            priority: None,
            payload,
            max_retries: None,
            scheduled_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Apply defaults and check every creation constraint.
    pub fn validate(self) -> Result<ValidatedTask, ValidationError> {
        let task_type: TaskType = self.task_type.parse()?;

        let priority = match self.priority {
            None => DEFAULT_PRIORITY,
            Some(p) if (MIN_PRIORITY as i64..=MAX_PRIORITY as i64).contains(&p) => p as u8,
            Some(_) => {
                return Err(ValidationError::new(format!(
                    "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}"
                )));
            }
        };

        let max_retries = match self.max_retries {
            None => DEFAULT_MAX_RETRIES,
            Some(n) => u32::try_from(n)
                .map_err(|_| ValidationError::new("maxRetries must be a non-negative integer"))?,
        };

        let payload = TaskPayload::parse(task_type, self.payload)?;

        Ok(ValidatedTask {
            payload,
            priority,
            max_retries,
            // store precision, so the row reads back unchanged
            scheduled_at: self.scheduled_at.map(|at| at.trunc_subsecs(6)),
        })
    }
}

/// Creation input that passed validation; defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedTask {
    pub payload: TaskPayload,
    pub priority: u8,
    pub max_retries: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl ValidatedTask {
    /// Materialize as a fresh PENDING task.
    pub fn into_task(self, id: TaskId, now: DateTime<Utc>) -> Task {
        Task {
            id,
            payload: self.payload,
            status: TaskStatus::Pending,
            priority: self.priority,
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: self.max_retries,
            scheduled_at: self.scheduled_at,
            started_at: None,
            completed_at: None,
            claimed_by: None,
            created_at: now,
            updated_at: now,
        }
    }
}
