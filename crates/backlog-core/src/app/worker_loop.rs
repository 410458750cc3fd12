//! Worker pool: claim -> handle -> report, on `n` tokio tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handlers::HandlerRegistry;
use super::service::TaskService;
use crate::domain::{Outcome, Task};

/// Handle of a running pool.
/// - dropping it (or `request_shutdown`) stops every worker
/// - `shutdown_and_join` also waits for in-flight handlers to report
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` workers named `worker-0` .. `worker-{n-1}`.
    ///
    /// An idle worker sleeps `poll_interval` before asking again.
    pub fn spawn(
        n: usize,
        service: Arc<TaskService>,
        registry: Arc<HandlerRegistry>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for i in 0..n {
            let worker_id = format!("worker-{i}");
            let svc = Arc::clone(&service);
            let reg = Arc::clone(&registry);
            let rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, svc, reg, poll_interval, rx).await;
            }));
        }
        info!(
            workers = n,
            poll_interval_ms = poll_interval.as_millis() as u64,
            "worker pool started"
        );

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop taking new claims. Handlers already running are not cancelled.
    pub fn request_shutdown(&self) {
        // receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            if let Err(e) = j.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: String,
    service: Arc<TaskService>,
    registry: Arc<HandlerRegistry>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let claimed = match service.claim_next(&worker_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "claim failed");
                None
            }
        };

        let Some(task) = claimed else {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // sender gone: pool handle was dropped
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        };

        // no store lock is held here; the handler may take as long as it needs
        let outcome = run_handler(&worker_id, &registry, &task).await;
        let succeeded = outcome.is_success();

        match service.report_outcome_for(&task, outcome).await {
            Ok(after) => debug!(
                worker_id = %worker_id,
                task_id = %after.id,
                succeeded,
                status = %after.status,
                "outcome reported"
            ),
            Err(e) if e.is_conflict() || e.is_not_found() => warn!(
                worker_id = %worker_id,
                task_id = %task.id,
                error = %e,
                "outcome rejected, task moved on"
            ),
            Err(e) => error!(
                worker_id = %worker_id,
                task_id = %task.id,
                error = %e,
                "outcome report failed"
            ),
        }
    }
    debug!(worker_id = %worker_id, "worker stopped");
}

/// Run the handler on its own tokio task so a panic becomes a failure
/// outcome instead of taking the worker down.
async fn run_handler(worker_id: &str, registry: &Arc<HandlerRegistry>, task: &Task) -> Outcome {
    let registry = Arc::clone(registry);
    let owned = task.clone();

    match tokio::spawn(async move { registry.execute(&owned).await }).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                worker_id = %worker_id,
                task_id = %task.id,
                error = %e,
                "handler panicked"
            );
            Outcome::failure("handler panicked")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::handlers::TaskHandler;
    use crate::app::test_support::{Fixture, crawl};
    use crate::domain::{Pagination, TaskFilter, TaskStatus, TaskType};
    use crate::ports::TaskCounts;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _task: &Task) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Outcome::failure("simulated failure")
            } else {
                Outcome::success()
            }
        }
    }

    async fn wait_for(service: &TaskService, done: impl Fn(&TaskCounts) -> bool) -> TaskCounts {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let counts = service.counts().await.unwrap();
            if done(&counts) || tokio::time::Instant::now() > deadline {
                return counts;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_drains_queue_exactly_once() {
        let fx = Fixture::new();
        let service = Arc::new(fx.service());
        for _ in 0..25 {
            service.create_task(crawl()).await.unwrap();
        }

        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::Crawl, handler.clone()).unwrap();

        let pool = WorkerPool::spawn(
            4,
            Arc::clone(&service),
            Arc::new(registry),
            Duration::from_millis(5),
        );
        assert_eq!(pool.len(), 4);

        let counts = wait_for(&service, |c| c.completed == 25).await;
        pool.shutdown_and_join().await;

        assert_eq!(counts.completed, 25);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 25);
    }

    #[tokio::test]
    async fn failures_without_retries_end_failed() {
        let fx = Fixture::new();
        let service = Arc::new(fx.service());
        for _ in 0..3 {
            service
                .create_task(crawl().with_max_retries(0))
                .await
                .unwrap();
        }

        let mut registry = HandlerRegistry::new();
        registry
            .register(
                TaskType::Crawl,
                Arc::new(CountingHandler {
                    calls: AtomicUsize::new(0),
                    fail: true,
                }),
            )
            .unwrap();

        let pool = WorkerPool::spawn(
            2,
            Arc::clone(&service),
            Arc::new(registry),
            Duration::from_millis(5),
        );
        let counts = wait_for(&service, |c| c.failed == 3).await;
        pool.shutdown_and_join().await;

        assert_eq!(counts.failed, 3);
    }

    #[tokio::test]
    async fn missing_handler_fails_the_attempt() {
        let fx = Fixture::new();
        let service = Arc::new(fx.service());
        let task = service
            .create_task(crawl().with_max_retries(0))
            .await
            .unwrap();

        let pool = WorkerPool::spawn(
            1,
            Arc::clone(&service),
            Arc::new(HandlerRegistry::new()),
            Duration::from_millis(5),
        );
        wait_for(&service, |c| c.failed == 1).await;
        pool.shutdown_and_join().await;

        let after = service.get_task(task.id).await.unwrap();
        assert_eq!(
            after.error_message.as_deref(),
            Some("no handler registered for CRAWL")
        );
    }

    struct PanicOnceHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for PanicOnceHandler {
        async fn handle(&self, _task: &Task) -> Outcome {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("parser blew up");
            }
            Outcome::success()
        }
    }

    #[tokio::test]
    async fn handler_panic_fails_the_task_and_worker_survives() {
        let fx = Fixture::new();
        let service = Arc::new(fx.service());
        for _ in 0..2 {
            service
                .create_task(crawl().with_max_retries(0))
                .await
                .unwrap();
        }

        let mut registry = HandlerRegistry::new();
        registry
            .register(
                TaskType::Crawl,
                Arc::new(PanicOnceHandler {
                    calls: AtomicUsize::new(0),
                }),
            )
            .unwrap();

        let pool = WorkerPool::spawn(
            1,
            Arc::clone(&service),
            Arc::new(registry),
            Duration::from_millis(5),
        );
        let counts = wait_for(&service, |c| c.failed == 1 && c.completed == 1).await;
        pool.shutdown_and_join().await;

        assert_eq!((counts.failed, counts.completed), (1, 1));
        let failed = service
            .list_tasks(
                &TaskFilter::default().with_status(TaskStatus::Failed),
                &Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(failed[0].error_message.as_deref(), Some("handler panicked"));
    }

    #[tokio::test]
    async fn idle_pool_shuts_down_promptly() {
        let fx = Fixture::new();
        let service = Arc::new(fx.service());
        let pool = WorkerPool::spawn(
            3,
            service,
            Arc::new(HandlerRegistry::new()),
            Duration::from_secs(60),
        );

        tokio::time::timeout(Duration::from_secs(1), pool.shutdown_and_join())
            .await
            .unwrap();
    }
}
