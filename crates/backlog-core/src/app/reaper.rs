//! Reaper: fails RUNNING tasks whose worker went quiet.
//!
//! A task counts as stale when it has been RUNNING for longer than
//! `stale_after`. It is failed through the regular failure path, so the
//! retry policy still decides between re-queue and terminal FAILED.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::lifecycle::LifecycleManager;
use crate::domain::{LogDraft, LogLevel, TaskError};
use crate::ports::{Clock, IdGenerator, TaskStore};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);
const SWEEP_BATCH: usize = 100;

pub struct Reaper {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    lifecycle: Arc<LifecycleManager>,
    stale_after: Duration,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        lifecycle: Arc<LifecycleManager>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            lifecycle,
            stale_after,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Fail every currently stale task. Returns how many were reaped.
    ///
    /// Tasks that finish or get reaped elsewhere while the sweep runs are
    /// skipped.
    pub async fn sweep_once(&self) -> Result<usize, TaskError> {
        let stale_after = TimeDelta::from_std(self.stale_after).unwrap_or(TimeDelta::MAX);
        let Some(cutoff) = self.clock.now().checked_sub_signed(stale_after) else {
            return Ok(0);
        };
        let message = format!("worker lease expired after {}s", self.stale_after.as_secs());

        let mut reaped = 0;
        loop {
            let batch = self.store.list_stale_running(cutoff, SWEEP_BATCH).await?;
            let batch_len = batch.len();
            let mut progressed = false;

            for task in batch {
                let note = LogDraft::new(
                    self.ids.generate_log_id(),
                    LogLevel::Warn,
                    "worker lease expired",
                )
                .with_metadata(json!({
                    "claimedBy": task.claimed_by,
                    "startedAt": task.started_at,
                    "staleAfterSecs": self.stale_after.as_secs(),
                }));

                match self.lifecycle.fail(&task, &message, vec![note]).await {
                    Ok(after) => {
                        reaped += 1;
                        progressed = true;
                        warn!(
                            task_id = %after.id,
                            claimed_by = task.claimed_by.as_deref().unwrap_or("-"),
                            status = %after.status,
                            "reaped stale task"
                        );
                    }
                    Err(e) if e.is_conflict() || e.is_not_found() => {
                        debug!(
                            task_id = %task.id,
                            error = %e,
                            "stale task moved on before reaping"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            if batch_len < SWEEP_BATCH || !progressed {
                break;
            }
        }

        if reaped > 0 {
            info!(reaped, "reaper sweep finished");
        }
        Ok(reaped)
    }

    /// Run `sweep_once` every `interval` until shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // sender dropped with the handle
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.sweep_once().await {
                    warn!(error = %e, "reaper sweep failed");
                }
            }
            debug!("reaper stopped");
        });

        ReaperHandle { shutdown_tx, join }
    }
}

/// Handle of a spawned reaper loop.
pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown_and_join(self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}
