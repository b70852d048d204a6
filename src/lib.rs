//! # AURORA Orchestrator
//!
//! A durable task orchestrator for multi-agent workloads. Producers submit
//! typed tasks; a pool of workers dispatches each one to the agent handler
//! registered for its kind, retrying recoverable failures with exponential
//! backoff and parking exhausted tasks in a dead-letter channel.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: Task records, lifecycle transitions and the compare-and-set task store
//! - **[`queue`]**: Durable FIFO channels (main, processing, deadletter)
//! - **[`worker`]**: Agent handlers and the worker pool that runs them
//! - **[`retry`]**: Backoff policies and the retry vs dead-letter decision
//! - **[`deadletter`]**: Dead-letter inspection, manual retry and streak alerts
//! - **[`events`]**: Per-kind broadcast of task lifecycle events
//! - **[`storage`]**: File and in-memory persistence backends
//! - **[`orchestrator`]**: Configuration, startup recovery and the public facade
//!
//! ## Guarantees
//!
//! - A task is in at most one channel at a time and its status says which.
//! - Status changes are compare-and-set, so two workers never run the same attempt.
//! - A task is never lost across a stop or a crash: recovery puts every
//!   unfinished task back in main.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aurora_orchestrator::{HandlerFailure, Orchestrator, OrchestratorConfig, handler_fn};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::open(OrchestratorConfig::in_memory()).await?;
//!
//!     orchestrator.register_handler(
//!         "grade",
//!         handler_fn(|ctx| async move {
//!             let score = ctx.payload["score"]
//!                 .as_u64()
//!                 .ok_or_else(|| HandlerFailure::non_recoverable("missing score"))?;
//!             Ok::<_, HandlerFailure>(json!({ "passed": score >= 50 }))
//!         }),
//!     );
//!     orchestrator.start_default().await;
//!
//!     let task_id = orchestrator.submit("grade", json!({ "score": 72 })).await?;
//!     println!("Submitted task: {}", task_id);
//!     Ok(())
//! }
//! ```

/// Dead-letter channel management and consecutive-failure alerting.
pub mod deadletter;

/// Environment constants and path utilities.
///
/// Centralizes the on-disk layout of the state directory and the
/// configuration discovery locations.
pub mod env;

pub mod error;

/// Task lifecycle event bus.
pub mod events;

pub mod orchestrator;

/// Main, processing and deadletter channels.
pub mod queue;

pub mod retry;

/// Persistence backends.
pub mod storage;

/// Task records and the task store.
pub mod task;

/// Agent handlers and the worker pool.
pub mod worker;

// CLI module for command-line interface
pub mod cli;

pub use deadletter::{DeadLetterFilter, DeadLetterHandler};
pub use error::{OrchestratorError, OrchestratorResult};
pub use events::{EventKind, EventStream, TaskEvent};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorStatus, RecoveryReport};
pub use queue::{Channel, QueueDepths};
pub use retry::RetryPolicy;
pub use storage::{FileBackend, MemoryBackend, StorageBackend, StorageKind};
pub use task::{Task, TaskId, TaskKind, TaskStatus};
pub use worker::{AgentHandler, HandlerFailure, StopReport, TaskContext, handler_fn};
