//! Decision model: what happens to a task after a failed attempt.
//!
//! `Decider` maps (task, failure) to a `Decision` without side effects. The
//! `LifecycleManager` carries out the decision against the store.

use std::time::Duration;

use super::retry::RetryPolicy;
use super::task::Task;

/// The next action for a task whose attempt just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Put the task back to PENDING after `delay`, as retry number `retry_count`.
    Requeue {
        retry_count: u32,
        delay: Duration,
        reason: String,
    },

    /// Leave the task terminally FAILED.
    GiveUp { reason: String },
}

/// Trait for deciding the next action after a failure.
///
/// Implementations must be pure: given the same task and error they return
/// the same decision.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &Task, error_message: &str) -> Decision;
}

/// Retry-count based decider with exponential backoff.
///
/// - Requeue if retry_count < max_retries
/// - Give up otherwise
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &Task, _error_message: &str) -> Decision {
        if !self
            .retry_policy
            .is_retryable(task.retry_count, task.max_retries)
        {
            return Decision::GiveUp {
                reason: format!(
                    "max retries reached: {}/{}",
                    task.retry_count, task.max_retries
                ),
            };
        }

        let retry_count = task.retry_count + 1;
        let delay = self.retry_policy.backoff(retry_count);
        Decision::Requeue {
            retry_count,
            delay,
            reason: format!(
                "retry {}/{} after {:?}",
                retry_count, task.max_retries, delay
            ),
        }
    }
}
