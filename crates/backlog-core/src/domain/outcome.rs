//! Outcome model: what a worker reports after executing a claimed task.
//!
//! Architecture-agnostic: it does not assume queues, workers, or persistence.

use serde::{Deserialize, Serialize};

/// The result of one execution attempt.
///
/// Serialized as `{"outcome": "SUCCESS", "result": ...}` or
/// `{"outcome": "FAILURE", "errorMessage": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },

    Failure {
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
}

impl Outcome {
    pub fn success() -> Self {
        Outcome::Success { result: None }
    }

    pub fn success_with(result: serde_json::Value) -> Self {
        Outcome::Success {
            result: Some(result),
        }
    }

    pub fn failure(error_message: impl Into<String>) -> Self {
        Outcome::Failure {
            error_message: error_message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}
