use crate::task::{TaskId, TaskKind};
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How a handler invocation went wrong
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerFailure {
    /// Worth another attempt (upstream hiccup, rate limit, flaky dependency)
    #[error("{0}")]
    Recoverable(String),

    /// Retrying cannot help (malformed payload, missing resource)
    #[error("{0}")]
    NonRecoverable(String),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
}

impl HandlerFailure {
    pub fn recoverable(message: impl fmt::Display) -> Self {
        HandlerFailure::Recoverable(message.to_string())
    }

    pub fn non_recoverable(message: impl fmt::Display) -> Self {
        HandlerFailure::NonRecoverable(message.to_string())
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, HandlerFailure::NonRecoverable(_))
    }
}

impl From<anyhow::Error> for HandlerFailure {
    fn from(error: anyhow::Error) -> Self {
        HandlerFailure::Recoverable(format!("{:#}", error))
    }
}

/// Everything a handler gets to see about the task it runs
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    /// 1-based number of this attempt
    pub attempt: u32,
    pub worker_id: usize,
}

/// An agent: the code that actually performs one kind of task.
///
/// Handlers run inside their own tokio task with a deadline; a panic or a
/// timeout is reported to the retry logic like a recoverable failure.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value, HandlerFailure>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> AgentHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerFailure>> + Send + 'static,
{
    async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value, HandlerFailure> {
        (self.f)(ctx.clone()).await
    }
}

/// Lift an async closure into a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn AgentHandler>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerFailure>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Kind to handler routing table, shared between the orchestrator and workers
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<TaskKind, Arc<dyn AgentHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning `true` when it replaced an earlier one
    pub fn register(&self, kind: TaskKind, handler: Arc<dyn AgentHandler>) -> bool {
        self.handlers.insert(kind, handler).is_some()
    }

    pub fn get(&self, kind: &TaskKind) -> Option<Arc<dyn AgentHandler>> {
        self.handlers.get(kind).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, kind: &TaskKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.handlers.iter().map(|e| e.key().clone()).collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
