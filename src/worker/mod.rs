//! Agent handlers and the worker pool that dispatches tasks to them.

pub mod handler;
pub mod pool;


pub use handler::{AgentHandler, HandlerFailure, HandlerRegistry, TaskContext, handler_fn};
pub use pool::{PoolMetrics, StopReport, WorkerPool, WorkerSettings};
