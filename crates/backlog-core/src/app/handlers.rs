//! Task handlers and their registry.
//!
//! The registry is built once during start-up (mutable) and shared read-only
//! by the workers afterwards, so lookups need no locking.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Outcome, Task, TaskType};

/// Executes the external work for one task type.
///
/// Handlers report failure through `Outcome::Failure`; the core decides what
/// happens next.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Outcome;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for task type {0} is already registered")]
    DuplicateHandler(TaskType),

    #[error("no handler registered for task types: {0:?}")]
    MissingHandlers(Vec<TaskType>),
}

/// task type -> handler
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: TaskType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Fail fast at start-up if any of `expected` has no handler.
    pub fn ensure_covers(&self, expected: &[TaskType]) -> Result<(), RegistryError> {
        let missing: Vec<TaskType> = expected
            .iter()
            .copied()
            .filter(|t| !self.handlers.contains_key(t))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::MissingHandlers(missing))
        }
    }

    /// Run the handler for `task`. A missing handler is a failed attempt.
    pub async fn execute(&self, task: &Task) -> Outcome {
        let task_type = task.task_type();
        match self.get(task_type) {
            Some(handler) => handler.handle(task).await,
            None => Outcome::failure(format!("no handler registered for {task_type}")),
        }
    }
}
