//! Durable substrate under the task store and the queue transport.
//!
//! The store writes every task mutation through a [`StorageBackend`] and the
//! transport persists each channel after every change, so a crash between two
//! operations loses at most the operation in flight.

pub mod file;
pub mod memory;

#[cfg(test)]
mod tests;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use crate::queue::{Channel, QueueEntry};
use crate::task::{Task, TaskId};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Backend selection in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Memory,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Every task record currently persisted
    async fn load_tasks(&self) -> Result<Vec<Task>>;

    /// Insert or replace a task record
    async fn put_task(&self, task: &Task) -> Result<()>;

    /// Delete a task record; deleting a missing record is not an error
    async fn delete_task(&self, task_id: TaskId) -> Result<()>;

    /// Persisted entries of a channel in FIFO order, empty if never saved
    async fn load_channel(&self, channel: Channel) -> Result<Vec<QueueEntry>>;

    /// Replace the persisted entries of a channel
    async fn save_channel(&self, channel: Channel, entries: &[QueueEntry]) -> Result<()>;

    /// Short name for logs and status output
    fn name(&self) -> &'static str;
}

/// Open the backend selected by `kind`
pub fn open_backend(
    kind: StorageKind,
    state_dir: &Path,
    checksum_validation: bool,
) -> Result<Arc<dyn StorageBackend>> {
    match kind {
        StorageKind::File => Ok(Arc::new(FileBackend::open(state_dir, checksum_validation)?)),
        StorageKind::Memory => Ok(Arc::new(MemoryBackend::new())),
    }
}
