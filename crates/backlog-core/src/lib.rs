//! backlog-core
//!
//! Durable background-task core: admission, priority dispatch, retry with
//! backoff, and a per-task audit trail.
//!
//! # Modules
//! - **domain**: task record, payloads, state machine, retry policy, errors
//! - **ports**: seams to the outside (`TaskStore`, `Clock`, `IdGenerator`)
//! - **impls**: store implementations (in-memory, PostgreSQL behind `postgres`)
//! - **app**: lifecycle, dispatch, audit, reaper, worker pool, `TaskService`
//! - **config**: TOML configuration
//! - **observability**: tracing subscriber setup
//!
//! # Example
//! ```ignore
//! let store = Arc::new(InMemoryTaskStore::new());
//! let service = TaskService::builder(store).build();
//!
//! let task = service
//!     .create_task(NewTask::new(TaskType::Crawl, json!({"url": "https://example.org"})))
//!     .await?;
//! if let Some(claimed) = service.claim_next("worker-1").await? {
//!     service.report_outcome(claimed.id, Outcome::success()).await?;
//! }
//! ```

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
