//! Domain model (IDs, task record, payloads, state machine, policies, errors).

pub mod decision;
pub mod errors;
pub mod filter;
pub mod ids;
pub mod log;
pub mod outcome;
pub mod payload;
pub mod retry;
pub mod state;
pub mod task;
pub mod task_type;

pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{StoreError, TaskError, ValidationError};
pub use filter::{Pagination, SortField, SortOrder, TaskFilter};
pub use ids::{ParseIdError, TaskId, TaskLogId};
pub use log::{LogDraft, LogLevel, TaskLog};
pub use outcome::Outcome;
pub use payload::{
    CrawlPayload, DocumentFormat, GenerateSummaryPayload, IndexPagePayload, ParseDocumentPayload,
    TaskPayload,
};
pub use retry::RetryPolicy;
pub use state::{ParseStatusError, TaskStatus};
pub use task::{NewTask, Task, ValidatedTask};
pub use task_type::TaskType;
