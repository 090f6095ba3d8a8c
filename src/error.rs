//! Error types for the progress engine and its configuration.
//!
//! Expected cancellation and unknown resume points are not errors; they have
//! defined behavior in the runner and stream session.

use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No running task with this id belongs to the requesting user.
    #[error("task {task_id} not found")]
    TaskNotFound {
        /// The id the caller asked for.
        task_id: String,
    },

    /// The engine has begun shutting down and refuses new work.
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Short stable label (snake_case) for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            EngineError::TaskNotFound { .. } => "task_not_found",
            EngineError::ShuttingDown => "engine_shutting_down",
        }
    }
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },
}

impl ConfigError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Invalid { .. } => "config_invalid",
        }
    }
}
