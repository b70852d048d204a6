use super::alert::AlertTracker;
use crate::error::OrchestratorResult;
use crate::events::{EventBus, EventKind, TaskEvent};
use crate::queue::{Channel, QueueTransport};
use crate::task::{StatusUpdate, Task, TaskId, TaskKind, TaskStatus, TaskStore, age_cutoff};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Selection for dead-letter listings
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub kind: Option<TaskKind>,
    /// Only tasks dead-lettered at or after this instant
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl DeadLetterFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: impl Into<TaskKind>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Only tasks dead-lettered within the last `age`
    pub fn within(self, age: chrono::Duration) -> Self {
        self.since(age_cutoff(age))
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, task: &Task) -> bool {
        if let Some(kind) = &self.kind
            && &task.kind != kind
        {
            return false;
        }
        if let Some(since) = self.since
            && task.completed_at.unwrap_or(task.updated_at) < since
        {
            return false;
        }
        true
    }
}

/// Owns everything that happens to tasks in the dead-letter channel
pub struct DeadLetterHandler {
    store: Arc<TaskStore>,
    queue: Arc<QueueTransport>,
    events: Arc<EventBus>,
    alerts: AlertTracker,
}

impl DeadLetterHandler {
    pub fn new(
        store: Arc<TaskStore>,
        queue: Arc<QueueTransport>,
        events: Arc<EventBus>,
        alert_threshold: u32,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            alerts: AlertTracker::new(alert_threshold),
        }
    }

    /// Park a processing task in the dead-letter channel.
    ///
    /// `after_attempt` means a handler invocation just finished: the attempt
    /// is counted and a `failed` event precedes `dead_lettered`.
    pub(crate) async fn dead_letter(
        &self,
        task_id: TaskId,
        reason: impl Into<String>,
        after_attempt: bool,
    ) -> OrchestratorResult<Task> {
        let reason = reason.into();
        let mut update = StatusUpdate::new().with_error(reason.clone());
        if after_attempt {
            update = update.record_attempt();
        }

        let task = self
            .store
            .update_status(task_id, TaskStatus::Processing, TaskStatus::DeadLettered, update)
            .await?;

        if !self
            .queue
            .move_entry(task_id, Channel::Processing, Channel::DeadLetter)
            .await?
        {
            self.queue.enqueue(Channel::DeadLetter, task_id).await?;
        }

        warn!(
            task_id = %task.id,
            kind = %task.kind,
            attempt = task.attempts,
            "Task dead-lettered: {}",
            reason
        );

        if after_attempt {
            self.events.publish(TaskEvent::for_task(EventKind::Failed, &task));
        }
        self.events
            .publish(TaskEvent::for_task(EventKind::DeadLettered, &task));

        if let Some(streak) = self.alerts.record_dead_letter(&task.kind) {
            error!(
                kind = %task.kind,
                "{} consecutive tasks dead-lettered, raising alert",
                streak
            );
            self.events
                .publish(TaskEvent::alert(&task, streak, self.alerts.threshold()));
        }

        Ok(task)
    }

    /// A task of `kind` completed, ending its dead-letter streak
    pub(crate) fn record_success(&self, kind: &TaskKind) {
        self.alerts.record_success(kind);
    }

    /// Current consecutive dead-letter count for `kind`
    pub fn streak(&self, kind: &TaskKind) -> u32 {
        self.alerts.streak(kind)
    }

    /// Dead-lettered tasks matching `filter`, most recent first
    pub async fn list_dead_lettered(&self, filter: &DeadLetterFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .store
            .list_by_status(TaskStatus::DeadLettered)
            .await
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();

        tasks.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        tasks
    }

    pub async fn count(&self) -> usize {
        self.queue.length(Channel::DeadLetter).await
    }

    /// Send a dead-lettered task back to the main channel with a fresh
    /// attempt budget
    pub async fn retry(&self, task_id: TaskId) -> OrchestratorResult<Task> {
        let task = self
            .store
            .update_status(
                task_id,
                TaskStatus::DeadLettered,
                TaskStatus::Queued,
                StatusUpdate::new().reset_attempts().clear_error(),
            )
            .await?;

        if !self
            .queue
            .move_entry(task_id, Channel::DeadLetter, Channel::Main)
            .await?
        {
            self.queue.enqueue(Channel::Main, task_id).await?;
        }

        info!(
            task_id = %task.id,
            kind = %task.kind,
            "Dead-lettered task requeued (manual retry #{})",
            task.manual_retries
        );
        self.events.publish(TaskEvent::for_task(EventKind::Retried, &task));

        Ok(task)
    }

    /// Retry every dead-lettered task matching `filter`.
    ///
    /// The filter's limit keeps the most recent matches; those are requeued
    /// oldest first. Tasks another caller retried or purged meanwhile are
    /// skipped.
    pub async fn retry_matching(
        &self,
        filter: &DeadLetterFilter,
    ) -> OrchestratorResult<Vec<TaskId>> {
        let mut candidates = self.list_dead_lettered(filter).await;
        candidates.reverse();

        let mut retried = Vec::with_capacity(candidates.len());
        for task in candidates {
            match self.retry(task.id).await {
                Ok(task) => retried.push(task.id),
                Err(e) if e.is_stale() => {
                    debug!(task_id = %task.id, "Skipping task that left the dead-letter channel: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        if !retried.is_empty() {
            info!("Requeued {} dead-lettered tasks", retried.len());
        }
        Ok(retried)
    }

    /// Permanently delete dead-lettered tasks parked for longer than `older_than`
    pub async fn purge(&self, older_than: chrono::Duration) -> OrchestratorResult<usize> {
        let removed = self
            .store
            .purge(TaskStatus::DeadLettered, age_cutoff(older_than))
            .await?;

        for task in &removed {
            self.queue.remove(Channel::DeadLetter, task.id).await?;
        }

        if !removed.is_empty() {
            info!("Purged {} dead-lettered tasks", removed.len());
        }
        Ok(removed.len())
    }
}
