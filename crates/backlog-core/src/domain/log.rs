//! Append-only audit records for task lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{TaskId, TaskLogId};
use super::state::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// One immutable audit row. Never updated; removed only with its task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLog {
    pub id: TaskLogId,
    pub task_id: TaskId,
    pub level: LogLevel,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
}

/// A log row before it is bound to a task and a timestamp.
///
/// Transitions build drafts up front and the store writes them in the same
/// atomic step as the status change (the claim path does not know the task
/// id until the store has picked one).
#[derive(Debug, Clone, PartialEq)]
pub struct LogDraft {
    pub id: TaskLogId,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

impl LogDraft {
    pub fn new(id: TaskLogId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id,
            level,
            message: message.into(),
            metadata: None,
        }
    }

    /// Draft for a status change; metadata records `from`/`to`.
    pub fn transition(
        id: TaskLogId,
        level: LogLevel,
        from: Option<TaskStatus>,
        to: TaskStatus,
        message: impl Into<String>,
    ) -> Self {
        let metadata = serde_json::json!({
            "from": from.map(TaskStatus::as_str),
            "to": to.as_str(),
        });
        Self::new(id, level, message).with_metadata(metadata)
    }

    /// Merge extra keys into the metadata object (or replace non-object metadata).
    pub fn with_metadata(mut self, extra: serde_json::Value) -> Self {
        match (&mut self.metadata, extra) {
            (Some(serde_json::Value::Object(base)), serde_json::Value::Object(more)) => {
                base.extend(more);
            }
            (slot, extra) => *slot = Some(extra),
        }
        self
    }

    pub fn bind(self, task_id: TaskId, created_at: DateTime<Utc>) -> TaskLog {
        TaskLog {
            id: self.id,
            task_id,
            level: self.level,
            message: self.message,
            metadata: self.metadata,
            created_at,
        }
    }
}
