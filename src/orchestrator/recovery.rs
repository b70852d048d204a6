//! Reconciliation of persisted tasks and channels after a restart.
//!
//! Task status is authoritative; channel snapshots only contribute ordering.
//! After recovery every non-terminal task sits in exactly one channel that
//! matches its status and the processing channel is empty.

use crate::error::OrchestratorResult;
use crate::queue::{Channel, QueueEntry, QueueTransport};
use crate::task::{StatusUpdate, Task, TaskId, TaskStatus, TaskStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// What recovery had to repair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub tasks_loaded: usize,
    /// Processing tasks whose worker never finished, back in main
    pub requeued_processing: usize,
    /// Tasks that were waiting out a backoff delay, back in main
    pub requeued_failed: usize,
    /// Queued tasks no channel referenced
    pub enqueued_orphans: usize,
    /// Dead-lettered tasks missing from the dead-letter channel
    pub refiled_dead_letters: usize,
    pub dropped_unknown: usize,
    pub dropped_duplicates: usize,
    pub dropped_completed: usize,
}

impl RecoveryReport {
    /// Whether anything needed repair
    pub fn is_clean(&self) -> bool {
        self.requeued_processing == 0
            && self.requeued_failed == 0
            && self.enqueued_orphans == 0
            && self.refiled_dead_letters == 0
            && self.dropped_unknown == 0
            && self.dropped_duplicates == 0
            && self.dropped_completed == 0
    }
}

#[derive(Default)]
struct Placement {
    /// Entries of main that stay where they are
    main: Vec<QueueEntry>,
    /// Tasks returned to main behind everything already waiting
    requeued: Vec<QueueEntry>,
    dead_letter: Vec<QueueEntry>,
}

pub(crate) async fn recover(
    store: &TaskStore,
    queue: &QueueTransport,
) -> OrchestratorResult<RecoveryReport> {
    let tasks = store.list_all().await;
    let mut report = RecoveryReport {
        tasks_loaded: tasks.len(),
        ..Default::default()
    };
    let by_id: HashMap<TaskId, &Task> = tasks.iter().map(|t| (t.id, t)).collect();

    let mut placement = Placement::default();
    let mut seen: HashSet<TaskId> = HashSet::new();

    for channel in Channel::ALL {
        for entry in queue.entries(channel).await {
            let Some(task) = by_id.get(&entry.task_id) else {
                warn!(task_id = %entry.task_id, "Dropping {} reference to unknown task", channel);
                report.dropped_unknown += 1;
                continue;
            };
            if !seen.insert(entry.task_id) {
                report.dropped_duplicates += 1;
                continue;
            }
            place(store, task, Some((channel, entry)), &mut placement, &mut report).await?;
        }
    }

    // Tasks no channel knew about, oldest first
    for task in &tasks {
        if seen.insert(task.id) {
            place(store, task, None, &mut placement, &mut report).await?;
        }
    }

    let placements = placement
        .main
        .into_iter()
        .chain(placement.requeued)
        .map(|entry| (Channel::Main, entry))
        .chain(
            placement
                .dead_letter
                .into_iter()
                .map(|entry| (Channel::DeadLetter, entry)),
        )
        .collect();
    queue.reconcile(placements).await?;

    if report.is_clean() {
        info!("Recovered {} tasks, nothing to repair", report.tasks_loaded);
    } else {
        info!(
            tasks = report.tasks_loaded,
            requeued_processing = report.requeued_processing,
            requeued_failed = report.requeued_failed,
            orphans = report.enqueued_orphans,
            refiled = report.refiled_dead_letters,
            dropped_unknown = report.dropped_unknown,
            dropped_duplicates = report.dropped_duplicates,
            dropped_completed = report.dropped_completed,
            "Recovery repaired persisted state"
        );
    }

    Ok(report)
}

async fn place(
    store: &TaskStore,
    task: &Task,
    found: Option<(Channel, QueueEntry)>,
    placement: &mut Placement,
    report: &mut RecoveryReport,
) -> OrchestratorResult<()> {
    let from = found.as_ref().map(|(channel, _)| *channel);

    match task.status {
        TaskStatus::Queued => match found {
            Some((Channel::Main, entry)) => placement.main.push(entry),
            Some((Channel::Processing, _)) => {
                report.requeued_processing += 1;
                placement.requeued.push(QueueEntry::new(task.id));
            }
            Some(_) => placement.requeued.push(QueueEntry::new(task.id)),
            None => {
                report.enqueued_orphans += 1;
                placement.requeued.push(QueueEntry::new(task.id));
            }
        },
        TaskStatus::Processing | TaskStatus::Failed => {
            let status = task.status;
            store
                .update_status(task.id, status, TaskStatus::Queued, StatusUpdate::new())
                .await?;
            if status == TaskStatus::Processing {
                report.requeued_processing += 1;
            } else {
                report.requeued_failed += 1;
            }
            placement.requeued.push(QueueEntry::new(task.id));
        }
        TaskStatus::DeadLettered => match found {
            Some((Channel::DeadLetter, entry)) => placement.dead_letter.push(entry),
            _ => {
                report.refiled_dead_letters += 1;
                placement.dead_letter.push(QueueEntry::new(task.id));
            }
        },
        TaskStatus::Completed => {
            if from.is_some() {
                report.dropped_completed += 1;
            }
        }
    }

    Ok(())
}
