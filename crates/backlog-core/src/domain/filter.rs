//! Listing filters, sorting and pagination. No business semantics.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::state::TaskStatus;
use super::task::Task;
use super::task_type::TaskType;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

/// All set fields must match (AND).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    #[serde(default, rename = "type")]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub min_priority: Option<u8>,
}

impl TaskFilter {
    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_min_priority(mut self, min_priority: u8) -> Self {
        self.min_priority = Some(min_priority);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.task_type.is_none_or(|t| task.task_type() == t)
            && self.status.is_none_or(|s| task.status == s)
            && self.min_priority.is_none_or(|p| task.priority >= p)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Priority,
    ScheduledAt,
}

impl SortField {
    pub fn column(self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::Priority => "priority",
            SortField::ScheduledAt => "scheduled_at",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub sort_by: SortField,
    #[serde(default)]
    pub order: SortOrder,
}

fn default_limit() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
            sort_by: SortField::default(),
            order: SortOrder::default(),
        }
    }
}

impl Pagination {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit,
            offset,
            ..Self::default()
        }
    }

    pub fn sorted_by(mut self, field: SortField, order: SortOrder) -> Self {
        self.sort_by = field;
        self.order = order;
        self
    }

    /// Limit clamped to `1..=MAX_PAGE_SIZE`.
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    /// Ordering used by in-memory listing. Ties fall back to id ascending so
    /// pages are stable. Missing `scheduled_at` sorts last in either order,
    /// matching PostgreSQL's `NULLS LAST`.
    pub fn compare(&self, a: &Task, b: &Task) -> Ordering {
        let primary = match self.sort_by {
            SortField::CreatedAt => self.directed(a.created_at.cmp(&b.created_at)),
            SortField::UpdatedAt => self.directed(a.updated_at.cmp(&b.updated_at)),
            SortField::Priority => self.directed(a.priority.cmp(&b.priority)),
            SortField::ScheduledAt => match (a.scheduled_at, b.scheduled_at) {
                (Some(x), Some(y)) => self.directed(x.cmp(&y)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }

    fn directed(&self, ord: Ordering) -> Ordering {
        match self.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }
}
