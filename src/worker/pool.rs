use super::handler::{AgentHandler, HandlerFailure, HandlerRegistry, TaskContext};
use crate::deadletter::DeadLetterHandler;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, EventKind, TaskEvent};
use crate::queue::{Channel, QueueEntry, QueueTransport};
use crate::retry::{self, RetryDecision, RetryPolicies};
use crate::task::{StatusUpdate, Task, TaskId, TaskKind, TaskStatus, TaskStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Pause after an infrastructure error before a worker claims again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Runtime knobs for the pool, derived from configuration
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Longest a worker parks waiting for work before re-checking shutdown
    pub dequeue_timeout: Duration,
    pub handler_timeout: Duration,
    pub handler_timeouts: HashMap<TaskKind, Duration>,
    /// Number of recent outcomes the failure rate is computed over
    pub failure_window: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_secs(5),
            handler_timeout: Duration::from_secs(1800),
            handler_timeouts: HashMap::new(),
            failure_window: 100,
        }
    }
}

impl WorkerSettings {
    pub fn timeout_for(&self, kind: &TaskKind) -> Duration {
        self.handler_timeouts
            .get(kind)
            .copied()
            .unwrap_or(self.handler_timeout)
    }
}

/// What `stop` had to do to leave no work behind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    /// Handlers cut off when the grace period ran out
    pub interrupted: usize,
    /// Backoff retries moved to main ahead of schedule
    pub flushed_retries: usize,
    /// Processing entries no worker finished, returned to main
    pub requeued_processing: usize,
}

/// Point-in-time pool metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub workers: usize,
    pub busy: usize,
    pub utilization: f64,
    pub recent_failure_rate: f64,
    pub pending_retries: usize,
}

struct InFlight {
    worker_id: usize,
    started_at: DateTime<Utc>,
    abort: AbortHandle,
}

enum Outcome {
    Success(serde_json::Value),
    Failure(HandlerFailure),
    Interrupted,
}

/// State shared by every worker and by the pool handle
pub(crate) struct WorkerShared {
    store: Arc<TaskStore>,
    queue: Arc<QueueTransport>,
    events: Arc<EventBus>,
    dead_letters: Arc<DeadLetterHandler>,
    registry: HandlerRegistry,
    policies: Arc<RetryPolicies>,
    settings: WorkerSettings,
    workers: AtomicUsize,
    busy: AtomicUsize,
    in_flight: DashMap<TaskId, InFlight>,
    pending_retries: DashMap<TaskId, JoinHandle<()>>,
    /// `true` marks a failed attempt
    outcomes: StdMutex<VecDeque<bool>>,
}

#[derive(Default)]
struct PoolState {
    shutdown: Option<watch::Sender<bool>>,
    workers: Vec<JoinHandle<()>>,
}

/// Fixed-size pool of tokio tasks pulling from the main channel
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    running: AtomicBool,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<TaskStore>,
        queue: Arc<QueueTransport>,
        events: Arc<EventBus>,
        dead_letters: Arc<DeadLetterHandler>,
        registry: HandlerRegistry,
        policies: Arc<RetryPolicies>,
        settings: WorkerSettings,
    ) -> Self {
        let shared = WorkerShared {
            store,
            queue,
            events,
            dead_letters,
            registry,
            policies,
            settings,
            workers: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            in_flight: DashMap::new(),
            pending_retries: DashMap::new(),
            outcomes: StdMutex::new(VecDeque::new()),
        };

        Self {
            shared: Arc::new(shared),
            running: AtomicBool::new(false),
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn `worker_count` workers. Returns `false` if already running.
    pub async fn start(&self, worker_count: usize) -> bool {
        let mut state = self.state.lock().await;
        if self.running.load(Ordering::SeqCst) {
            debug!("Worker pool already running");
            return false;
        }

        let worker_count = worker_count.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        state.workers = (0..worker_count)
            .map(|worker_id| {
                let shared = Arc::clone(&self.shared);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { shared.run_worker(worker_id, shutdown).await })
            })
            .collect();
        state.shutdown = Some(shutdown_tx);

        self.shared.workers.store(worker_count, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        info!("Started worker pool with {} workers", worker_count);
        true
    }

    /// Stop claiming, give in-flight handlers `grace` to finish, then put
    /// every unfinished task back at the tail of main.
    pub async fn stop(&self, grace: Duration) -> OrchestratorResult<StopReport> {
        let mut state = self.state.lock().await;
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(StopReport::default());
        }

        info!("Stopping worker pool (grace {:?})", grace);
        if let Some(shutdown) = state.shutdown.take() {
            let _ = shutdown.send(true);
        }

        let mut workers = std::mem::take(&mut state.workers);
        let mut report = StopReport::default();

        let finished = tokio::time::timeout(
            grace,
            futures::future::join_all(workers.iter_mut()),
        )
        .await;

        if finished.is_err() {
            report.interrupted = self.shared.abort_in_flight();
            warn!(
                "Grace period elapsed, interrupted {} in-flight handlers",
                report.interrupted
            );

            // Handles already joined must not be polled again
            workers.retain(|worker| !worker.is_finished());
            let settled = tokio::time::timeout(
                grace.max(ERROR_BACKOFF),
                futures::future::join_all(workers.iter_mut()),
            )
            .await;
            if settled.is_err() {
                error!("Workers did not exit after interruption, aborting them");
                for worker in &workers {
                    worker.abort();
                }
            }
        }

        report.flushed_retries = self.shared.flush_pending_retries().await?;
        report.requeued_processing = self.shared.requeue_processing_leftovers().await?;
        self.shared.workers.store(0, Ordering::SeqCst);

        info!(
            interrupted = report.interrupted,
            flushed_retries = report.flushed_retries,
            requeued = report.requeued_processing,
            "Worker pool stopped"
        );
        Ok(report)
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.shared.metrics()
    }

    /// Return processing entries older than `max_age` that no worker owns
    pub async fn sweep_stalled(&self, max_age: Duration) -> OrchestratorResult<usize> {
        self.shared.sweep_stalled(max_age).await
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit after their current task; unfinished work is recovered on next open
        if let Some(shutdown) = self.state.get_mut().shutdown.take() {
            let _ = shutdown.send(true);
        }
        for timer in self.shared.pending_retries.iter() {
            timer.abort();
        }
    }
}

impl WorkerShared {
    async fn run_worker(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let ready = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                ready = self.queue.wait_for_entries(Channel::Main, self.settings.dequeue_timeout) => ready,
            };
            if !ready || *shutdown.borrow() {
                continue;
            }

            let result = match self.queue.try_claim().await {
                Ok(Some(entry)) => self.process_entry(worker_id, entry).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                error!(worker_id, "Worker error: {}", e);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }

        debug!(worker_id, "Worker stopped");
    }

    async fn process_entry(
        self: &Arc<Self>,
        worker_id: usize,
        entry: QueueEntry,
    ) -> OrchestratorResult<()> {
        self.busy.fetch_add(1, Ordering::SeqCst);
        let result = self.execute(worker_id, entry.task_id).await;
        self.busy.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn execute(self: &Arc<Self>, worker_id: usize, task_id: TaskId) -> OrchestratorResult<()> {
        let task = match self
            .store
            .update_status(
                task_id,
                TaskStatus::Queued,
                TaskStatus::Processing,
                StatusUpdate::new(),
            )
            .await
        {
            Ok(task) => task,
            Err(e) if e.is_stale() => {
                warn!(%task_id, worker_id, "Dropping stale queue reference: {}", e);
                self.return_to_main(task_id).await?;
                return Ok(());
            }
            Err(e) => {
                self.queue
                    .move_entry(task_id, Channel::Processing, Channel::Main)
                    .await?;
                return Err(e);
            }
        };

        let Some(handler) = self.registry.get(&task.kind) else {
            error!(
                %task_id,
                "{}",
                OrchestratorError::HandlerNotRegistered(task.kind.clone())
            );
            let reason = format!("no handler registered for type {}", task.kind);
            self.dead_letters.dead_letter(task_id, reason, false).await?;
            return Ok(());
        };

        let policy = self.policies.for_kind(&task.kind);
        if task.attempts >= policy.max_attempts {
            let reason = format!(
                "retries exhausted after {} attempts{}",
                task.attempts,
                task.error
                    .as_deref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            );
            self.dead_letters.dead_letter(task_id, reason, false).await?;
            return Ok(());
        }

        info!(
            %task_id,
            kind = %task.kind,
            worker_id,
            attempt = task.attempts + 1,
            "Task started"
        );
        self.events
            .publish(TaskEvent::for_task(EventKind::Started, &task));

        let outcome = self.invoke(worker_id, &task, handler).await;
        self.settle(task, outcome).await
    }

    /// Run the handler in its own task, bounded by the kind's timeout
    async fn invoke(
        &self,
        worker_id: usize,
        task: &Task,
        handler: Arc<dyn AgentHandler>,
    ) -> Outcome {
        let ctx = TaskContext {
            task_id: task.id,
            kind: task.kind.clone(),
            payload: task.payload.clone(),
            attempt: task.attempts + 1,
            worker_id,
        };
        let timeout = self.settings.timeout_for(&task.kind);

        let mut join = tokio::spawn(async move { handler.handle(&ctx).await });
        self.in_flight.insert(
            task.id,
            InFlight {
                worker_id,
                started_at: Utc::now(),
                abort: join.abort_handle(),
            },
        );

        let outcome = match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(Ok(output))) => Outcome::Success(output),
            Ok(Ok(Err(failure))) => Outcome::Failure(failure),
            Ok(Err(join_error)) if join_error.is_cancelled() => Outcome::Interrupted,
            Ok(Err(join_error)) => Outcome::Failure(HandlerFailure::Recoverable(format!(
                "handler panicked: {}",
                panic_message(join_error.into_panic())
            ))),
            Err(_) => {
                join.abort();
                Outcome::Failure(HandlerFailure::Timeout(timeout))
            }
        };

        self.in_flight.remove(&task.id);
        outcome
    }

    async fn settle(self: &Arc<Self>, task: Task, outcome: Outcome) -> OrchestratorResult<()> {
        let task_id = task.id;

        match outcome {
            Outcome::Success(output) => {
                let task = self
                    .store
                    .update_status(
                        task_id,
                        TaskStatus::Processing,
                        TaskStatus::Completed,
                        StatusUpdate::new().record_attempt().with_output(output),
                    )
                    .await?;
                self.queue.complete(task_id).await?;
                self.dead_letters.record_success(&task.kind);
                self.record_outcome(false);

                info!(%task_id, kind = %task.kind, attempt = task.attempts, "Task completed");
                self.events
                    .publish(TaskEvent::for_task(EventKind::Completed, &task));
            }
            Outcome::Failure(failure) => {
                self.record_outcome(true);
                let attempts_made = task.attempts + 1;
                let policy = self.policies.for_kind(&task.kind);

                match retry::decide(attempts_made, &failure, policy) {
                    RetryDecision::DeadLetter { reason } => {
                        self.dead_letters.dead_letter(task_id, reason, true).await?;
                    }
                    RetryDecision::Retry { attempt, delay } => {
                        let mut update = StatusUpdate::new()
                            .record_attempt()
                            .with_error(failure.to_string());
                        if let Some(at) = chrono::Duration::from_std(delay)
                            .ok()
                            .and_then(|d| Utc::now().checked_add_signed(d))
                        {
                            update = update.retry_at(at);
                        }

                        let task = self
                            .store
                            .update_status(
                                task_id,
                                TaskStatus::Processing,
                                TaskStatus::Failed,
                                update,
                            )
                            .await?;
                        self.queue.complete(task_id).await?;

                        warn!(
                            %task_id,
                            kind = %task.kind,
                            attempt = task.attempts,
                            "Task failed, attempt {} in {:?}: {}",
                            attempt,
                            delay,
                            failure
                        );
                        self.events
                            .publish(TaskEvent::for_task(EventKind::Failed, &task));
                        self.schedule_retry(task_id, delay);
                    }
                }
            }
            Outcome::Interrupted => {
                info!(%task_id, kind = %task.kind, "Task interrupted, returning to main");
                self.return_to_main(task_id).await?;
            }
        }

        Ok(())
    }

    /// Re-enqueue a failed task once its backoff delay has elapsed
    fn schedule_retry(self: &Arc<Self>, task_id: TaskId, delay: Duration) {
        let shared = Arc::clone(self);
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let timer = tokio::spawn(async move {
            // Wait until the handle is registered so removal cannot race insertion
            let _ = registered_rx.await;
            tokio::time::sleep(delay).await;
            shared.pending_retries.remove(&task_id);

            if let Err(e) = shared.requeue_failed(task_id).await {
                error!(%task_id, "Failed to requeue task after backoff: {}", e);
                shared.schedule_retry(task_id, ERROR_BACKOFF);
            }
        });

        self.pending_retries.insert(task_id, timer);
        let _ = registered_tx.send(());
    }

    /// Failed → Queued plus enqueue to main; `false` if the task moved on
    async fn requeue_failed(&self, task_id: TaskId) -> OrchestratorResult<bool> {
        match self
            .store
            .update_status(
                task_id,
                TaskStatus::Failed,
                TaskStatus::Queued,
                StatusUpdate::new(),
            )
            .await
        {
            Ok(task) => {
                self.queue.enqueue(Channel::Main, task_id).await?;
                debug!(%task_id, attempt = task.attempts + 1, "Retry enqueued");
                Ok(true)
            }
            Err(e) if e.is_stale() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Put a task found in the processing channel where its status says it belongs.
    ///
    /// Returns `true` when the task went back to main.
    async fn return_to_main(&self, task_id: TaskId) -> OrchestratorResult<bool> {
        let task = match self.store.get(task_id).await {
            Ok(task) => task,
            Err(OrchestratorError::NotFound(_)) => {
                self.queue.complete(task_id).await?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match task.status {
            TaskStatus::Processing => {
                self.store
                    .update_status(
                        task_id,
                        TaskStatus::Processing,
                        TaskStatus::Queued,
                        StatusUpdate::new(),
                    )
                    .await?;
                if !self
                    .queue
                    .move_entry(task_id, Channel::Processing, Channel::Main)
                    .await?
                {
                    self.queue.enqueue(Channel::Main, task_id).await?;
                }
                Ok(true)
            }
            TaskStatus::Queued => Ok(self
                .queue
                .move_entry(task_id, Channel::Processing, Channel::Main)
                .await?),
            TaskStatus::DeadLettered => {
                self.queue
                    .move_entry(task_id, Channel::Processing, Channel::DeadLetter)
                    .await?;
                Ok(false)
            }
            // A backoff timer or the stop flush owns failed tasks
            TaskStatus::Failed | TaskStatus::Completed => {
                self.queue.complete(task_id).await?;
                Ok(false)
            }
        }
    }

    fn abort_in_flight(&self) -> usize {
        let mut aborted = 0;
        for entry in self.in_flight.iter() {
            debug!(
                task_id = %entry.key(),
                worker_id = entry.worker_id,
                "Interrupting handler running since {}",
                entry.started_at
            );
            entry.abort.abort();
            aborted += 1;
        }
        aborted
    }

    async fn flush_pending_retries(&self) -> OrchestratorResult<usize> {
        let timers: Vec<TaskId> = self.pending_retries.iter().map(|e| *e.key()).collect();
        for task_id in timers {
            if let Some((_, timer)) = self.pending_retries.remove(&task_id) {
                timer.abort();
            }
        }

        let mut flushed = 0;
        for task in self.store.list_by_status(TaskStatus::Failed).await {
            if self.requeue_failed(task.id).await? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    async fn requeue_processing_leftovers(&self) -> OrchestratorResult<usize> {
        let mut requeued = 0;
        for entry in self.queue.entries(Channel::Processing).await {
            if self.return_to_main(entry.task_id).await? {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn sweep_stalled(&self, max_age: Duration) -> OrchestratorResult<usize> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut swept = 0;

        for entry in self.queue.entries(Channel::Processing).await {
            if self.in_flight.contains_key(&entry.task_id) {
                continue;
            }
            if now.signed_duration_since(entry.enqueued_at) < max_age {
                continue;
            }

            warn!(
                task_id = %entry.task_id,
                "Processing entry stalled since {}, returning it",
                entry.enqueued_at
            );
            if self.return_to_main(entry.task_id).await? {
                swept += 1;
            }
        }
        Ok(swept)
    }

    fn record_outcome(&self, failed: bool) {
        let mut window = self
            .outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        window.push_back(failed);
        while window.len() > self.settings.failure_window.max(1) {
            window.pop_front();
        }
    }

    fn metrics(&self) -> PoolMetrics {
        let workers = self.workers.load(Ordering::SeqCst);
        let busy = self.busy.load(Ordering::SeqCst);

        let recent_failure_rate = {
            let window = self
                .outcomes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if window.is_empty() {
                0.0
            } else {
                window.iter().filter(|failed| **failed).count() as f64 / window.len() as f64
            }
        };

        PoolMetrics {
            workers,
            busy,
            utilization: if workers == 0 {
                0.0
            } else {
                busy as f64 / workers as f64
            },
            recent_failure_rate,
            pending_retries: self.pending_retries.len(),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
