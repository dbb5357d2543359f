//! Error types for the scheduler.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the scheduler, its queue and task handles.
#[derive(Debug, Error)]
pub enum Error {
    /// The task was cancelled before it produced a result.
    #[error("Task cancelled")]
    Cancelled,

    /// `get_timeout` expired before the task finished.
    #[error("Timed out after {0:?} waiting for task result")]
    Timeout(Duration),

    /// The task body returned an error. Shared so every `get` can report it.
    #[error("Task failed: {0}")]
    TaskFailed(#[source] Arc<dyn StdError + Send + Sync>),

    /// The task body panicked on the consumer thread.
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// The scheduler no longer accepts new work.
    #[error("Scheduler is shut down")]
    Shutdown,

    /// A blocking wait on the queue was interrupted.
    #[error("Wait interrupted")]
    Interrupted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn task_failed(err: anyhow::Error) -> Self {
        let source: Box<dyn StdError + Send + Sync> = err.into();
        Self::TaskFailed(Arc::from(source))
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::Panicked(message.into())
    }

    /// Whether this error reports a cancelled task.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
