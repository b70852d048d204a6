use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Agent kind a task is routed to ("generate_paper", "grade", "sync_roadmap", ...).
///
/// Kept as a string tag rather than a closed enum so that a submission for a
/// kind nobody registered can still be stored and dead-lettered on dispatch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskKind(String);

impl TaskKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for TaskKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl From<String> for TaskKind {
    fn from(kind: String) -> Self {
        Self(kind)
    }
}

/// Lifecycle status of a task
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the main channel for a worker
    Queued,
    /// Claimed by a worker, handler running
    Processing,
    /// Handler returned a result
    Completed,
    /// Last attempt failed, a retry is scheduled for `next_attempt_at`
    Failed,
    /// Retry budget exhausted or failure marked non-recoverable
    DeadLettered,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::DeadLettered,
    ];

    /// Edges of the task state machine
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Queued)
                | (Processing, DeadLettered)
                | (Failed, Queued)
                | (DeadLettered, Queued)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::DeadLettered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "dead_lettered" | "deadlettered" | "dead_letter" => Ok(TaskStatus::DeadLettered),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Core task record, owned by the task store
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    /// Informational only, dispatch order is FIFO
    #[serde(default)]
    pub priority: u8,
    /// Finished handler invocations in the current delivery cycle
    pub attempts: u32,
    /// Times an operator pulled this task back out of the dead-letter channel
    #[serde(default)]
    pub manual_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub output: Option<serde_json::Value>,
}

/// Field changes that travel with a status transition
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub error: Option<String>,
    pub clear_error: bool,
    pub output: Option<serde_json::Value>,
    pub record_attempt: bool,
    pub reset_attempts: bool,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.clear_error = true;
        self
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Count the attempt that just finished
    pub fn record_attempt(mut self) -> Self {
        self.record_attempt = true;
        self
    }

    pub fn reset_attempts(mut self) -> Self {
        self.reset_attempts = true;
        self
    }

    pub fn retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }
}

impl Task {
    /// Create a new queued task
    pub fn new(kind: TaskKind, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            status: TaskStatus::Queued,
            priority: 0,
            attempts: 0,
            manual_retries: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
            error: None,
            output: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Get task age since creation
    pub fn age(&self) -> Duration {
        Utc::now().signed_duration_since(self.created_at)
    }

    /// Get task runtime if currently processing
    pub fn runtime(&self) -> Option<Duration> {
        match (self.status, self.started_at) {
            (TaskStatus::Processing, Some(started_at)) => {
                Some(Utc::now().signed_duration_since(started_at))
            }
            _ => None,
        }
    }

    /// JSON snapshot carried by lifecycle events
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Apply a validated transition. Edge checks live in the store.
    pub(crate) fn apply_transition(&mut self, next: TaskStatus, update: StatusUpdate) {
        let now = Utc::now();

        match next {
            TaskStatus::Processing => {
                self.started_at = Some(now);
                self.next_attempt_at = None;
            }
            TaskStatus::Completed => {
                self.completed_at = Some(now);
                self.error = None;
            }
            TaskStatus::DeadLettered => {
                self.completed_at = Some(now);
                self.next_attempt_at = None;
            }
            TaskStatus::Queued => {
                if self.status == TaskStatus::DeadLettered {
                    self.manual_retries = self.manual_retries.saturating_add(1);
                    self.completed_at = None;
                }
                self.next_attempt_at = None;
            }
            TaskStatus::Failed => {}
        }

        if update.reset_attempts {
            self.attempts = 0;
        }
        if update.record_attempt {
            self.attempts = self.attempts.saturating_add(1);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        } else if update.clear_error {
            self.error = None;
        }
        if let Some(output) = update.output {
            self.output = Some(output);
        }
        if let Some(at) = update.next_attempt_at {
            self.next_attempt_at = Some(at);
        }

        self.status = next;
        self.updated_at = now;
    }
}
