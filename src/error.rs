use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Misuse of the task API.
///
/// These indicate a malformed dependency graph and are reported immediately
/// instead of being folded into a task's failure state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    #[error("task was already started")]
    AlreadyStarted,

    #[error("task has already completed")]
    AlreadyCompleted,

    #[error("task is not running")]
    NotRunning,
}

/// The reason a task ended in the failed state.
#[derive(Debug, Error, Clone)]
pub enum TaskFailure {
    #[error("{0:#}")]
    Error(Arc<anyhow::Error>),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("a predecessor task failed")]
    PredecessorFailed,

    #[error("a child task failed")]
    ChildFailed,

    #[error("task was cancelled")]
    Cancelled,

    #[error("task could not be scheduled: {0}")]
    Rejected(PoolError),
}

impl TaskFailure {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self::Error(Arc::new(err.into()))
    }

    /// Whether this task itself went wrong, as opposed to inheriting the
    /// failure of another task.
    pub fn is_own(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Panicked(_) | Self::Rejected(_))
    }
}

impl From<anyhow::Error> for TaskFailure {
    fn from(e: anyhow::Error) -> Self {
        TaskFailure::Error(Arc::new(e))
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("thread pool has been shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Couldn't access '{0}'.\n{1}")]
    Io(Utf8PathBuf, #[source] std::io::Error),

    #[error("Dependency '{0}' does not exist")]
    MissingDependency(Utf8PathBuf),

    #[error("Couldn't encode dependency record for '{0}'.\n{1}")]
    Encode(Utf8PathBuf, String),

    #[error("Couldn't decode dependency record '{0}'.\n{1}")]
    Decode(Utf8PathBuf, String),

    #[error("Dependency record has no targets")]
    NoTargets,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Couldn't write cache entry '{0}'.\n{1}")]
    Io(Utf8PathBuf, #[source] std::io::Error),

    #[error("Couldn't encode cache variant record.\n{0}")]
    Encode(String),

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file '{0}'.\n{1}")]
    Io(Utf8PathBuf, #[source] std::io::Error),

    #[error("Couldn't parse config file '{0}'.\n{1}")]
    Parse(Utf8PathBuf, #[source] serde_json::Error),

    #[error("Invalid value '{1}' for environment variable {0}")]
    Env(&'static str, String),
}

#[derive(Debug, Error)]
pub enum KilnError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Failed to spawn worker thread.\n{0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
