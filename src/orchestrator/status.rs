use crate::queue::QueueDepths;
use crate::task::{TaskKind, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Snapshot returned by `Orchestrator::status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub storage: String,
    pub queue_depths: QueueDepths,
    /// Failed tasks waiting out their backoff delay
    pub awaiting_retry: usize,
    pub task_counts: BTreeMap<TaskStatus, usize>,
    pub workers: usize,
    pub busy_workers: usize,
    /// Busy workers over pool size, 0 when stopped
    pub worker_utilization: f64,
    /// Share of failed attempts among the most recent outcomes
    pub recent_failure_rate: f64,
    pub registered_kinds: Vec<TaskKind>,
}

impl fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Orchestrator: {} ({} storage)",
            if self.running { "running" } else { "stopped" },
            self.storage
        )?;
        writeln!(
            f,
            "Queues: main={} processing={} deadletter={} awaiting_retry={}",
            self.queue_depths.main,
            self.queue_depths.processing,
            self.queue_depths.dead_letter,
            self.awaiting_retry
        )?;
        writeln!(
            f,
            "Workers: {}/{} busy ({:.0}% utilization)",
            self.busy_workers,
            self.workers,
            self.worker_utilization * 100.0
        )?;
        writeln!(
            f,
            "Recent failure rate: {:.1}%",
            self.recent_failure_rate * 100.0
        )?;

        let counts: Vec<String> = self
            .task_counts
            .iter()
            .map(|(status, count)| format!("{}={}", status, count))
            .collect();
        writeln!(f, "Tasks: {}", counts.join(" "))?;

        if self.registered_kinds.is_empty() {
            write!(f, "Handlers: none registered")
        } else {
            let kinds: Vec<&str> = self.registered_kinds.iter().map(|k| k.as_str()).collect();
            write!(f, "Handlers: {}", kinds.join(", "))
        }
    }
}
