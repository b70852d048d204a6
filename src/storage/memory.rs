use super::StorageBackend;
use crate::queue::{Channel, QueueEntry};
use crate::task::{Task, TaskId};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct MemoryState {
    tasks: HashMap<TaskId, Task>,
    channels: HashMap<Channel, Vec<QueueEntry>>,
    failing_channels: HashSet<Channel>,
}

/// In-memory backend.
///
/// Clones share the same state, so dropping an orchestrator and opening a new
/// one on a clone behaves like a process restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until switched back off
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make saves of `channel` alone fail until switched back off
    pub async fn set_fail_channel(&self, channel: Channel, fail: bool) {
        let mut state = self.state.lock().await;
        if fail {
            state.failing_channels.insert(channel);
        } else {
            state.failing_channels.remove(&channel);
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("memory backend is rejecting writes");
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.state.lock().await.tasks.values().cloned().collect())
    }

    async fn put_task(&self, task: &Task) -> Result<()> {
        self.check_writable()?;
        self.state.lock().await.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<()> {
        self.check_writable()?;
        self.state.lock().await.tasks.remove(&task_id);
        Ok(())
    }

    async fn load_channel(&self, channel: Channel) -> Result<Vec<QueueEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .channels
            .get(&channel)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_channel(&self, channel: Channel, entries: &[QueueEntry]) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        if state.failing_channels.contains(&channel) {
            anyhow::bail!("memory backend is rejecting writes to {}", channel);
        }
        state.channels.insert(channel, entries.to_vec());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
