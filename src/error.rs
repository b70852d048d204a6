use crate::task::{TaskId, TaskKind, TaskStatus};

/// Errors surfaced by the store, the queue and the orchestrator API.
///
/// Handler failures never show up here, they are translated into task
/// transitions and events by the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Status conflict for task {task_id}: expected {expected}, found {actual}")]
    StatusConflict {
        task_id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("No handler registered for type {0}")]
    HandlerNotRegistered(TaskKind),

    #[error("Storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Whether the error only means another actor got to the task first
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            OrchestratorError::StatusConflict { .. } | OrchestratorError::NotFound(_)
        )
    }

    /// Whether the task was not in the status the caller expected.
    ///
    /// For callers whose own edge is always legal, `InvalidTransition` can
    /// only mean the task had already moved somewhere that edge cannot
    /// start from.
    pub fn is_stale(&self) -> bool {
        self.is_conflict() || matches!(self, OrchestratorError::InvalidTransition { .. })
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
