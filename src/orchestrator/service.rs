//! # Orchestrator
//!
//! Composition root that wires the task store, queue transport, worker pool,
//! dead-letter handler and event bus on top of one storage backend.
//!
//! ```text
//!  submit ──► TaskStore ──► main ──► WorkerPool ──► AgentHandler
//!                             ▲           │
//!                             │  backoff  ├──► Completed
//!                             └───────────┤
//!                                         └──► deadletter ──► alert
//!                     EventBus ◄── every transition
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use aurora_orchestrator::{Orchestrator, OrchestratorConfig, handler_fn};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::open(OrchestratorConfig::default()).await?;
//!
//!     orchestrator.register_handler(
//!         "grade",
//!         handler_fn(|ctx| async move { Ok(json!({ "graded": ctx.payload })) }),
//!     );
//!     orchestrator.start(4).await;
//!
//!     let task_id = orchestrator.submit("grade", json!({ "submission": 42 })).await?;
//!     println!("submitted {}", task_id);
//!     println!("{}", orchestrator.status().await);
//!
//!     orchestrator.stop(Duration::from_secs(30)).await?;
//!     Ok(())
//! }
//! ```

use super::config::OrchestratorConfig;
use super::recovery::{self, RecoveryReport};
use super::status::OrchestratorStatus;
use crate::deadletter::DeadLetterHandler;
use crate::error::OrchestratorResult;
use crate::events::{EventBus, EventKind, EventStream, TaskEvent};
use crate::queue::{Channel, QueueTransport};
use crate::storage::{self, StorageBackend};
use crate::task::{Task, TaskId, TaskKind, TaskStatus, TaskStore, age_cutoff};
use crate::worker::{AgentHandler, HandlerRegistry, StopReport, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// The orchestrator. Share it behind an `Arc`; every method takes `&self`.
pub struct Orchestrator {
    config: OrchestratorConfig,
    backend: Arc<dyn StorageBackend>,
    store: Arc<TaskStore>,
    queue: Arc<QueueTransport>,
    events: Arc<EventBus>,
    dead_letters: Arc<DeadLetterHandler>,
    registry: HandlerRegistry,
    pool: WorkerPool,
    recovery: RecoveryReport,
}

impl Orchestrator {
    /// Open the configured backend and recover its state
    pub async fn open(config: OrchestratorConfig) -> OrchestratorResult<Self> {
        config.validate()?;
        let backend = storage::open_backend(
            config.storage,
            &config.state_dir,
            config.checksum_validation,
        )?;
        Self::with_backend(config, backend).await
    }

    /// Recover state from `backend` and build every component on top of it
    pub async fn with_backend(
        config: OrchestratorConfig,
        backend: Arc<dyn StorageBackend>,
    ) -> OrchestratorResult<Self> {
        config.validate()?;

        let store = Arc::new(TaskStore::open(backend.clone()).await?);
        let queue = Arc::new(QueueTransport::open(backend.clone()).await?);
        let recovery = recovery::recover(&store, &queue).await?;

        let events = Arc::new(EventBus::new(config.event_buffer));
        let dead_letters = Arc::new(DeadLetterHandler::new(
            store.clone(),
            queue.clone(),
            events.clone(),
            config.alert_threshold,
        ));
        let registry = HandlerRegistry::new();
        let pool = WorkerPool::new(
            store.clone(),
            queue.clone(),
            events.clone(),
            dead_letters.clone(),
            registry.clone(),
            Arc::new(config.retry_policies()),
            config.worker_settings(),
        );

        info!(
            storage = backend.name(),
            tasks = recovery.tasks_loaded,
            "Orchestrator ready"
        );

        Ok(Self {
            config,
            backend,
            store,
            queue,
            events,
            dead_letters,
            registry,
            pool,
            recovery,
        })
    }

    /// Route tasks of `kind` to `handler`.
    ///
    /// Meant to be called before `start`; a later registration only affects
    /// tasks claimed afterwards.
    pub fn register_handler(&self, kind: impl Into<TaskKind>, handler: Arc<dyn AgentHandler>) {
        let kind = kind.into();
        if self.registry.register(kind.clone(), handler) {
            warn!(kind = %kind, "Replaced previously registered handler");
        } else {
            info!(kind = %kind, "Registered handler");
        }
    }

    pub async fn submit(
        &self,
        kind: impl Into<TaskKind>,
        payload: serde_json::Value,
    ) -> OrchestratorResult<TaskId> {
        self.submit_task(Task::new(kind.into(), payload)).await
    }

    /// Submit with an informational priority. Dispatch order stays FIFO.
    pub async fn submit_with_priority(
        &self,
        kind: impl Into<TaskKind>,
        payload: serde_json::Value,
        priority: u8,
    ) -> OrchestratorResult<TaskId> {
        self.submit_task(Task::new(kind.into(), payload).with_priority(priority))
            .await
    }

    async fn submit_task(&self, task: Task) -> OrchestratorResult<TaskId> {
        let task = self.store.insert(task).await?;
        let task_id = task.id;

        // Subscribers see `created` before any worker can pick the task up
        self.events
            .publish(TaskEvent::for_task(EventKind::Created, &task));

        if let Err(e) = self.queue.enqueue(Channel::Main, task_id).await {
            error!(%task_id, "Failed to enqueue submitted task: {}", e);
            if let Err(cleanup) = self.store.remove(task_id).await {
                warn!(%task_id, "Failed to withdraw unqueued task: {}", cleanup);
            }
            return Err(e);
        }

        info!(%task_id, kind = %task.kind, "Task submitted");
        Ok(task_id)
    }

    /// Spawn `worker_count` workers; `false` if they are already running
    pub async fn start(&self, worker_count: usize) -> bool {
        self.pool.start(worker_count).await
    }

    /// Start with the configured worker count
    pub async fn start_default(&self) -> bool {
        self.pool.start(self.config.worker_count).await
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }

    /// Stop the workers, leaving every unfinished task queued in main
    pub async fn stop(&self, grace: Duration) -> OrchestratorResult<StopReport> {
        self.pool.stop(grace).await
    }

    /// Stop with the configured grace period
    pub async fn stop_default(&self) -> OrchestratorResult<StopReport> {
        self.pool.stop(self.config.stop_grace()).await
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let metrics = self.pool.metrics();
        let task_counts = self.store.counts().await;

        OrchestratorStatus {
            running: self.pool.is_running(),
            storage: self.backend.name().to_string(),
            queue_depths: self.queue.depths().await,
            awaiting_retry: task_counts
                .get(&TaskStatus::Failed)
                .copied()
                .unwrap_or_default(),
            task_counts,
            workers: metrics.workers,
            busy_workers: metrics.busy,
            worker_utilization: metrics.utilization,
            recent_failure_rate: metrics.recent_failure_rate,
            registered_kinds: self.registry.kinds(),
        }
    }

    pub async fn get_task(&self, task_id: TaskId) -> OrchestratorResult<Task> {
        self.store.get(task_id).await
    }

    /// Every task, oldest first
    pub async fn list_tasks(&self) -> Vec<Task> {
        self.store.list_all().await
    }

    pub async fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.store.list_by_status(status).await
    }

    pub fn dead_letters(&self) -> &DeadLetterHandler {
        &self.dead_letters
    }

    pub fn subscribe(&self, kind: EventKind) -> EventStream {
        self.events.subscribe(kind)
    }

    pub fn subscribe_all(&self) -> EventStream {
        self.events.subscribe_all()
    }

    /// Delete completed tasks that finished longer than `older_than` ago
    pub async fn purge_completed(&self, older_than: chrono::Duration) -> OrchestratorResult<usize> {
        let removed = self
            .store
            .purge(TaskStatus::Completed, age_cutoff(older_than))
            .await?;

        for task in &removed {
            if let Some(channel) = self.queue.contains(task.id).await {
                self.queue.remove(channel, task.id).await?;
            }
        }

        if !removed.is_empty() {
            info!("Purged {} completed tasks", removed.len());
        }
        Ok(removed.len())
    }

    /// Return processing entries no live worker owns and older than
    /// `max_age` to the main channel
    pub async fn sweep_stalled(&self, max_age: Duration) -> OrchestratorResult<usize> {
        self.pool.sweep_stalled(max_age).await
    }

    /// What recovery repaired when this orchestrator was opened
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}
