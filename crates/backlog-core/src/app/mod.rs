//! Application layer: services built from the ports.
//!
//! - **LifecycleManager**: creation and every RUNNING-sourced transition
//! - **Dispatcher**: atomic claim of the next eligible task
//! - **AuditTrail**: annotations and per-task history
//! - **Reaper**: fails tasks whose worker stopped reporting
//! - **TaskService**: the above behind one facade
//! - **WorkerPool** / **HandlerRegistry**: in-process execution loop

pub mod audit;
pub mod dispatcher;
pub mod handlers;
pub mod lifecycle;
pub mod reaper;
pub mod service;
pub mod worker_loop;

pub use self::audit::AuditTrail;
pub use self::dispatcher::Dispatcher;
pub use self::handlers::{HandlerRegistry, RegistryError, TaskHandler};
pub use self::lifecycle::LifecycleManager;
pub use self::reaper::{DEFAULT_STALE_AFTER, Reaper, ReaperHandle};
pub use self::service::{TaskService, TaskServiceBuilder};
pub use self::worker_loop::WorkerPool;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    use super::{AuditTrail, Dispatcher, LifecycleManager, TaskService};
    use crate::domain::{DefaultDecider, NewTask, TaskType};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{FixedClock, IdGenerator, UlidGenerator};

    /// In-memory store and a pinned clock, with every service wired to them.
    pub(crate) struct Fixture {
        pub t0: DateTime<Utc>,
        pub clock: Arc<FixedClock>,
        pub store: Arc<InMemoryTaskStore>,
        pub ids: Arc<dyn IdGenerator>,
        pub lifecycle: Arc<LifecycleManager>,
        pub dispatcher: Dispatcher,
        pub audit: AuditTrail,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
            let clock = Arc::new(FixedClock::new(t0));
            let store = Arc::new(InMemoryTaskStore::new());
            let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));

            let lifecycle = Arc::new(LifecycleManager::new(
                store.clone(),
                clock.clone(),
                ids.clone(),
                Arc::new(DefaultDecider::default()),
            ));
            let dispatcher = Dispatcher::new(store.clone(), clock.clone(), ids.clone());
            let audit = AuditTrail::new(store.clone(), clock.clone(), ids.clone());

            Self {
                t0,
                clock,
                store,
                ids,
                lifecycle,
                dispatcher,
                audit,
            }
        }

        /// A facade over the same store and clock.
        pub(crate) fn service(&self) -> TaskService {
            TaskService::new(self.store.clone(), self.clock.clone(), self.ids.clone())
        }
    }

    pub(crate) fn crawl() -> NewTask {
        NewTask::new(TaskType::Crawl, json!({"url": "https://example.org/papers"}))
    }
}
