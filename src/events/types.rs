use crate::task::{Task, TaskId, TaskKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Event topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Started,
    Completed,
    Failed,
    DeadLettered,
    /// Operator pulled a task out of the dead-letter channel
    Retried,
    /// Too many consecutive dead-letters for one kind
    Alert,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Created,
        EventKind::Started,
        EventKind::Completed,
        EventKind::Failed,
        EventKind::DeadLettered,
        EventKind::Retried,
        EventKind::Alert,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Started => "started",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::DeadLettered => "dead_lettered",
            EventKind::Retried => "retried",
            EventKind::Alert => "alert",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task lifecycle notification. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub task_id: TaskId,
    pub task_kind: TaskKind,
    pub attempts: u32,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Task record at publish time; alert details for `Alert`
    pub snapshot: serde_json::Value,
}

impl TaskEvent {
    pub fn for_task(kind: EventKind, task: &Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            task_id: task.id,
            task_kind: task.kind.clone(),
            attempts: task.attempts,
            error: task.error.clone(),
            timestamp: Utc::now(),
            snapshot: task.snapshot(),
        }
    }

    /// Alert raised by `task` reaching the dead-letter streak threshold
    pub fn alert(task: &Task, consecutive_dead_letters: u32, threshold: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: EventKind::Alert,
            task_id: task.id,
            task_kind: task.kind.clone(),
            attempts: task.attempts,
            error: Some(format!(
                "{} consecutive {} tasks dead-lettered",
                consecutive_dead_letters, task.kind
            )),
            timestamp: Utc::now(),
            snapshot: serde_json::json!({
                "consecutive_dead_letters": consecutive_dead_letters,
                "threshold": threshold,
                "last_error": task.error,
                "task": task.snapshot(),
            }),
        }
    }
}
