//! Error types for task lifecycle operations

use std::fmt;

use crate::ident::TaskId;
use crate::state::TaskState;

/// Error type for task lifecycle and storage operations
#[derive(Debug, Clone)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Kinds of task errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The identifier has no record in the persistence store
    TaskInexistence,
    /// The operation requires an active task, but the identifier is not
    /// in the active registry
    TaskExistence,
    /// The operation requires the task not to be running, but it is
    TaskRunning,
    /// The operation requires a running task, but it is not running
    TaskNotRunning,
    /// The operation requires the task not to be paused, but it is
    TaskPaused,
    /// The requested transition is not valid from the task's current state
    InvalidState,
    /// Invalid input (malformed identifier, bad configuration value, etc.)
    InvalidInput,
    /// Persistence store I/O or serialization failure
    Storage,
    /// Download engine failure (network error, decode error, etc.)
    Engine,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn task_inexistence(id: &TaskId) -> Self {
        Self::new(
            ErrorKind::TaskInexistence,
            format!("no record for task: {}", id),
        )
    }

    pub fn task_existence(id: &TaskId) -> Self {
        Self::new(ErrorKind::TaskExistence, format!("task not active: {}", id))
    }

    pub fn task_running(id: &TaskId) -> Self {
        Self::new(
            ErrorKind::TaskRunning,
            format!("task already running: {}", id),
        )
    }

    pub fn task_not_running(id: &TaskId, state: TaskState) -> Self {
        Self::new(
            ErrorKind::TaskNotRunning,
            format!("task {} is not running (state: {:?})", id, state),
        )
    }

    pub fn task_paused(id: &TaskId) -> Self {
        Self::new(ErrorKind::TaskPaused, format!("task already paused: {}", id))
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Engine, message)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<reqwest::Error> for TaskError {
    fn from(err: reqwest::Error) -> Self {
        Self::engine(err.to_string())
    }
}

/// Result type for task operations
pub type Result<T> = std::result::Result<T, TaskError>;
