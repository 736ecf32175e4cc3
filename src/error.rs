use std::sync::Arc;

use thiserror::Error;

/// The reason a promise was rejected.
///
/// Rejections are shared between every reaction that observes them, so the
/// underlying error lives behind an `Arc` and the wrapper stays cheap to clone.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct Rejection(#[from] pub(crate) Arc<anyhow::Error>);

impl Rejection {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// Rejection carrying a plain message.
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::new(anyhow::Error::msg(message))
    }
}

impl From<anyhow::Error> for Rejection {
    fn from(e: anyhow::Error) -> Self {
        Rejection(Arc::new(e))
    }
}

impl From<LookupError> for Rejection {
    fn from(e: LookupError) -> Self {
        Rejection::new(e)
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("{resource}:{key_type} '{key}' not found")]
    NotFound {
        resource: String,
        key_type: String,
        key: String,
    },
}

/// Returned by a step that did not complete.
#[derive(Debug, Error)]
pub enum StepError {
    /// Not an error: the step can't proceed yet and wants to be retried on a
    /// later pass, from the same position.
    #[error("step is blocked")]
    Blocked,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<SchedulerError> for StepError {
    fn from(e: SchedulerError) -> Self {
        StepError::Failed(anyhow::Error::new(e))
    }
}

impl From<Rejection> for StepError {
    fn from(e: Rejection) -> Self {
        StepError::Failed(anyhow::Error::new(e))
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task '{0}' does not exist")]
    UnknownTask(String),

    #[error("Resource '{0}' does not exist")]
    UnknownResource(String),

    #[error("No task is currently running")]
    NoCurrentTask,

    #[error("Task '{task}':\n{source}")]
    Step {
        task: String,
        source: anyhow::Error,
    },

    #[error(transparent)]
    Async(#[from] Rejection),

    #[error("Remaining tasks deadlocked; cannot proceed:\n\n{}", stalled(.entries))]
    Deadlock { entries: Vec<String> },
}

fn stalled(entries: &[String]) -> String {
    entries.iter().map(|entry| format!("\t{entry}\n")).collect()
}
