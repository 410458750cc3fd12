use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use backlog_core::app::{HandlerRegistry, TaskHandler, TaskService, WorkerPool};
use backlog_core::config::{BacklogConfig, StoreBackend};
use backlog_core::domain::{
    NewTask, Outcome, Pagination, SortField, SortOrder, Task, TaskFilter, TaskId, TaskStatus,
    TaskType,
};
use backlog_core::impls::InMemoryTaskStore;
use backlog_core::observability;
use backlog_core::ports::TaskStore;

#[derive(Debug, Parser)]
#[command(name = "backlog", version, about = "Background task queue")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Seed an in-memory queue and drain it with simulated handlers.
    Demo {
        #[arg(long, default_value_t = 12)]
        tasks: usize,

        /// Every K-th handler call fails (0 = never).
        #[arg(long, default_value_t = 4)]
        fail_every: usize,
    },

    /// Submit one task.
    Create {
        /// CRAWL, PARSE_DOCUMENT, GENERATE_SUMMARY or INDEX_PAGE.
        #[arg(long = "type")]
        task_type: String,

        /// Payload as a JSON object.
        #[arg(long)]
        payload: String,

        #[arg(long)]
        priority: Option<i64>,

        #[arg(long)]
        max_retries: Option<i64>,
    },

    /// List tasks, highest priority first.
    List {
        #[arg(long)]
        status: Option<TaskStatus>,

        #[arg(long = "type")]
        task_type: Option<TaskType>,

        #[arg(long)]
        min_priority: Option<u8>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show the audit trail of one task.
    Logs { task_id: TaskId },

    /// Task counts per status.
    Stats,

    /// Fail RUNNING tasks whose worker stopped reporting.
    Reap,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = BacklogConfig::load(cli.config.as_deref()).context("loading configuration")?;
    observability::init_from_config(&cfg.logging);

    match cli.command {
        Command::Demo { tasks, fail_every } => run_demo(&cfg, tasks, fail_every).await,
        Command::Create {
            task_type,
            payload,
            priority,
            max_retries,
        } => {
            let payload: Value = serde_json::from_str(&payload).context("--payload is not JSON")?;
            let input = NewTask {
                task_type,
                priority,
                payload,
                max_retries,
                scheduled_at: None,
            };

            let svc = open_service(&cfg).await?;
            print_json(&svc.create_task(input).await?)
        }
        Command::List {
            status,
            task_type,
            min_priority,
            limit,
        } => {
            let mut filter = TaskFilter::default();
            if let Some(s) = status {
                filter = filter.with_status(s);
            }
            if let Some(t) = task_type {
                filter = filter.with_type(t);
            }
            if let Some(p) = min_priority {
                filter = filter.with_min_priority(p);
            }
            let page = Pagination::new(limit, 0).sorted_by(SortField::Priority, SortOrder::Desc);

            let svc = open_service(&cfg).await?;
            print_json(&svc.list_tasks(&filter, &page).await?)
        }
        Command::Logs { task_id } => {
            let svc = open_service(&cfg).await?;
            print_json(&svc.list_logs(task_id).await?)
        }
        Command::Stats => {
            let svc = open_service(&cfg).await?;
            print_json(&svc.counts().await?)
        }
        Command::Reap => {
            let svc = open_service(&cfg).await?;
            let reaped = svc.reap_stale().await?;
            println!("reaped {reaped} task(s)");
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_service(cfg: &BacklogConfig, store: Arc<dyn TaskStore>) -> TaskService {
    TaskService::builder(store)
        .retry_policy(cfg.retry_policy())
        .stale_after(cfg.stale_after())
        .build()
}

async fn open_service(cfg: &BacklogConfig) -> anyhow::Result<TaskService> {
    let store: Arc<dyn TaskStore> = match cfg.store.backend {
        StoreBackend::Memory => {
            warn!("memory backend: nothing outlives this process");
            Arc::new(InMemoryTaskStore::new())
        }
        StoreBackend::Postgres => open_postgres(cfg).await?,
    };
    Ok(build_service(cfg, store))
}

#[cfg(feature = "postgres")]
async fn open_postgres(cfg: &BacklogConfig) -> anyhow::Result<Arc<dyn TaskStore>> {
    use backlog_core::impls::PostgresTaskStore;

    let url = cfg
        .store
        .database_url
        .as_deref()
        .context("store.database_url is not set")?;
    let store = PostgresTaskStore::connect(url, cfg.store.max_connections)
        .await
        .context("connecting to PostgreSQL")?;
    store.migrate().await.context("applying schema")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(_cfg: &BacklogConfig) -> anyhow::Result<Arc<dyn TaskStore>> {
    anyhow::bail!("the postgres backend needs a build with `--features postgres`")
}

// ========================================
// demo
// ========================================

/// Stand-in for the external services; fails every `fail_every`-th call
/// across all task types.
struct SimulatedHandler {
    calls: Arc<AtomicUsize>,
    fail_every: usize,
}

#[async_trait]
impl TaskHandler for SimulatedHandler {
    async fn handle(&self, task: &Task) -> Outcome {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        sleep(Duration::from_millis(25)).await;

        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Outcome::failure(format!("simulated upstream error (call {n})"));
        }
        Outcome::success_with(json!({ "handled": task.task_type().as_str(), "call": n }))
    }
}

fn demo_task(i: usize) -> NewTask {
    let priority = (i % 10) as i64 + 1;
    let paper = format!("paper-{i}");
    let input = match i % 4 {
        0 => NewTask::new(
            TaskType::Crawl,
            json!({ "url": format!("https://example.org/journal/{i}"), "maxDepth": 2 }),
        ),
        1 => NewTask::new(
            TaskType::ParseDocument,
            json!({ "documentUrl": format!("https://example.org/{paper}.pdf"), "format": "pdf" }),
        ),
        2 => NewTask::new(
            TaskType::GenerateSummary,
            json!({ "paperId": paper, "maxWords": 150 }),
        ),
        _ => NewTask::new(
            TaskType::IndexPage,
            json!({ "url": format!("https://example.org/{paper}"), "paperId": paper }),
        ),
    };
    input.with_priority(priority)
}

async fn run_demo(cfg: &BacklogConfig, tasks: usize, fail_every: usize) -> anyhow::Result<()> {
    let svc = Arc::new(build_service(cfg, Arc::new(InMemoryTaskStore::new())));

    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    for task_type in TaskType::ALL {
        registry.register(
            task_type,
            Arc::new(SimulatedHandler {
                calls: Arc::clone(&calls),
                fail_every,
            }),
        )?;
    }
    registry.ensure_covers(&TaskType::ALL)?;

    for i in 0..tasks {
        let task = svc.create_task(demo_task(i)).await?;
        info!(
            task_id = %task.id,
            task_type = %task.task_type(),
            priority = task.priority,
            "seeded"
        );
    }

    let pool = WorkerPool::spawn(
        cfg.dispatch.workers,
        Arc::clone(&svc),
        Arc::new(registry),
        cfg.poll_interval(),
    );
    let reaper = cfg
        .reaper
        .enabled
        .then(|| svc.reaper().spawn(cfg.reaper_interval()));

    let drained = tokio::select! {
        res = wait_until_drained(&svc) => { res?; true }
        _ = tokio::signal::ctrl_c() => false,
    };
    if !drained {
        warn!("interrupted; stopping workers");
    }

    pool.shutdown_and_join().await;
    if let Some(r) = reaper {
        r.shutdown_and_join().await;
    }

    println!("handler calls: {}", calls.load(Ordering::Relaxed));
    print_json(&svc.counts().await?)
}

async fn wait_until_drained(svc: &TaskService) -> anyhow::Result<()> {
    loop {
        let counts = svc.counts().await?;
        if counts.pending == 0 && counts.running == 0 {
            return Ok(());
        }
        sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_list_flags() {
        let cli = Cli::parse_from([
            "backlog",
            "list",
            "--status",
            "failed",
            "--type",
            "crawl",
            "--min-priority",
            "3",
        ]);
        match cli.command {
            Command::List {
                status,
                task_type,
                min_priority,
                limit,
            } => {
                assert_eq!(status, Some(TaskStatus::Failed));
                assert_eq!(task_type, Some(TaskType::Crawl));
                assert_eq!(min_priority, Some(3));
                assert_eq!(limit, 20);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn demo_tasks_pass_validation() {
        for i in 0..8 {
            demo_task(i).validate().unwrap();
        }
    }

    #[tokio::test]
    async fn simulated_handler_fails_on_schedule() {
        let handler = SimulatedHandler {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_every: 2,
        };
        let store = Arc::new(InMemoryTaskStore::new());
        let svc = build_service(&BacklogConfig::default(), store);
        let task = svc.create_task(demo_task(0)).await.unwrap();

        assert!(handler.handle(&task).await.is_success());
        assert!(!handler.handle(&task).await.is_success());
    }
}
