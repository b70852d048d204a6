use super::types::*;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::storage::StorageBackend;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Authoritative record of every task.
///
/// Status changes are compare-and-set on the caller's view of the prior
/// status. The write lock is held across the backend write, so two actors
/// racing on the same task are ordered and the loser gets `StatusConflict`,
/// or `InvalidTransition` when the winner left the task somewhere the
/// requested edge cannot start from.
pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    backend: Arc<dyn StorageBackend>,
}

impl TaskStore {
    /// Load every persisted task
    pub async fn open(backend: Arc<dyn StorageBackend>) -> OrchestratorResult<Self> {
        let tasks: HashMap<TaskId, Task> = backend
            .load_tasks()
            .await?
            .into_iter()
            .map(|task| (task.id, task))
            .collect();

        debug!("Task store opened with {} tasks", tasks.len());

        Ok(Self {
            tasks: RwLock::new(tasks),
            backend,
        })
    }

    /// Create a queued task with zero attempts
    pub async fn create_task(
        &self,
        kind: TaskKind,
        payload: serde_json::Value,
    ) -> OrchestratorResult<Task> {
        self.insert(Task::new(kind, payload)).await
    }

    /// Store a freshly built task
    pub async fn insert(&self, task: Task) -> OrchestratorResult<Task> {
        let mut tasks = self.tasks.write().await;
        self.backend.put_task(&task).await?;
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    /// Move a task from `expected` to `next`, applying `update` on the way
    pub async fn update_status(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
        update: StatusUpdate,
    ) -> OrchestratorResult<Task> {
        let mut tasks = self.tasks.write().await;
        let current = tasks
            .get(&task_id)
            .ok_or(OrchestratorError::NotFound(task_id))?;

        if !expected.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                task_id,
                from: expected,
                to: next,
            });
        }

        // A lost race only counts as a conflict if the edge from the actual
        // status is legal; otherwise the caller asked for a forbidden move
        if current.status != expected && !current.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                task_id,
                from: current.status,
                to: next,
            });
        }

        if current.status != expected {
            return Err(OrchestratorError::StatusConflict {
                task_id,
                expected,
                actual: current.status,
            });
        }

        let mut updated = current.clone();
        updated.apply_transition(next, update);
        self.backend.put_task(&updated).await?;
        tasks.insert(task_id, updated.clone());

        debug!(%task_id, "Task {} -> {}", expected, next);
        Ok(updated)
    }

    pub async fn get(&self, task_id: TaskId) -> OrchestratorResult<Task> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .cloned()
            .ok_or(OrchestratorError::NotFound(task_id))
    }

    /// Tasks in `status`, oldest first
    pub async fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Every task, oldest first
    pub async fn list_all(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    pub async fn count(&self, status: TaskStatus) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .count()
    }

    /// Number of tasks per status, every status present
    pub async fn counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for task in self.tasks.read().await.values() {
            *counts.entry(task.status).or_default() += 1;
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Permanently delete a task
    pub async fn remove(&self, task_id: TaskId) -> OrchestratorResult<Task> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(&task_id) {
            return Err(OrchestratorError::NotFound(task_id));
        }
        self.backend.delete_task(task_id).await?;
        tasks
            .remove(&task_id)
            .ok_or(OrchestratorError::NotFound(task_id))
    }

    /// Delete tasks in `status` that finished before `cutoff`
    pub async fn purge(
        &self,
        status: TaskStatus,
        cutoff: DateTime<Utc>,
    ) -> OrchestratorResult<Vec<Task>> {
        let mut tasks = self.tasks.write().await;
        let expired: Vec<TaskId> = tasks
            .values()
            .filter(|t| t.status == status)
            .filter(|t| t.completed_at.unwrap_or(t.updated_at) < cutoff)
            .map(|t| t.id)
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for task_id in expired {
            self.backend.delete_task(task_id).await?;
            if let Some(task) = tasks.remove(&task_id) {
                removed.push(task);
            }
        }

        Ok(removed)
    }
}

/// `now - age`, saturating at the earliest representable instant
pub(crate) fn age_cutoff(age: chrono::Duration) -> DateTime<Utc> {
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
