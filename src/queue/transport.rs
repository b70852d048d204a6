use crate::error::OrchestratorResult;
use crate::storage::StorageBackend;
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// The three ordered channels a task reference can live in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Waiting for a worker
    Main,
    /// Claimed by a worker
    Processing,
    /// Parked after a terminal failure
    DeadLetter,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Main, Channel::Processing, Channel::DeadLetter];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Main => "main",
            Channel::Processing => "processing",
            Channel::DeadLetter => "deadletter",
        }
    }

    fn index(self) -> usize {
        match self {
            Channel::Main => 0,
            Channel::Processing => 1,
            Channel::DeadLetter => 2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task reference plus the time it entered its current channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            enqueued_at: Utc::now(),
        }
    }
}

/// Channel lengths, as reported by `status()`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub main: usize,
    pub processing: usize,
    pub dead_letter: usize,
}

#[derive(Debug, Clone, Default)]
struct ChannelSet {
    queues: [VecDeque<QueueEntry>; 3],
}

impl ChannelSet {
    fn get(&self, channel: Channel) -> &VecDeque<QueueEntry> {
        &self.queues[channel.index()]
    }

    fn get_mut(&mut self, channel: Channel) -> &mut VecDeque<QueueEntry> {
        &mut self.queues[channel.index()]
    }

    fn locate(&self, task_id: TaskId) -> Option<Channel> {
        Channel::ALL
            .into_iter()
            .find(|c| self.get(*c).iter().any(|e| e.task_id == task_id))
    }

    fn take(&mut self, channel: Channel, task_id: TaskId) -> Option<QueueEntry> {
        let queue = self.get_mut(channel);
        let position = queue.iter().position(|e| e.task_id == task_id)?;
        queue.remove(position)
    }
}

/// Three FIFO channels of task references, persisted on every mutation.
///
/// A task id is present in at most one channel at a time: every insertion
/// first removes the id from wherever it currently sits. Waiting consumers are
/// parked on a per-channel [`Notify`] instead of polling.
pub struct QueueTransport {
    channels: Mutex<ChannelSet>,
    notifiers: [Notify; 3],
    backend: Arc<dyn StorageBackend>,
}

impl QueueTransport {
    /// Load the persisted channels. Placement is not validated here.
    pub async fn open(backend: Arc<dyn StorageBackend>) -> OrchestratorResult<Self> {
        let mut set = ChannelSet::default();
        for channel in Channel::ALL {
            *set.get_mut(channel) = backend.load_channel(channel).await?.into();
        }

        debug!(
            "Loaded channels: main={} processing={} deadletter={}",
            set.get(Channel::Main).len(),
            set.get(Channel::Processing).len(),
            set.get(Channel::DeadLetter).len()
        );

        Ok(Self {
            channels: Mutex::new(set),
            notifiers: Default::default(),
            backend,
        })
    }

    fn notifier(&self, channel: Channel) -> &Notify {
        &self.notifiers[channel.index()]
    }

    /// Run a mutation and persist the channels it touched.
    ///
    /// When persisting fails the in-memory state is rolled back and channels
    /// already written are rewritten with their previous entries. If that
    /// rewrite fails as well, the backend stays ahead of memory until
    /// recovery reconciles it on the next open.
    async fn apply<R>(
        &self,
        mutate: impl FnOnce(&mut ChannelSet) -> (R, Vec<Channel>),
    ) -> OrchestratorResult<R> {
        let mut set = self.channels.lock().await;
        let before = set.clone();
        let (result, touched) = mutate(&mut set);

        let mut written = Vec::with_capacity(touched.len());
        for channel in touched {
            let entries: Vec<QueueEntry> = set.get(channel).iter().cloned().collect();
            if let Err(e) = self.backend.save_channel(channel, &entries).await {
                *set = before;
                for channel in written {
                    let entries: Vec<QueueEntry> = set.get(channel).iter().cloned().collect();
                    if let Err(undo) = self.backend.save_channel(channel, &entries).await {
                        warn!(%channel, "Failed to restore persisted channel: {:#}", undo);
                    }
                }
                return Err(e.into());
            }
            written.push(channel);
        }

        Ok(result)
    }

    /// Append a task reference to the tail of `channel`
    pub async fn enqueue(&self, channel: Channel, task_id: TaskId) -> OrchestratorResult<()> {
        let previous = self
            .apply(|set| {
                let previous = set.locate(task_id);
                let mut touched = vec![channel];
                if let Some(previous) = previous {
                    set.take(previous, task_id);
                    if previous != channel {
                        touched.push(previous);
                    }
                }
                set.get_mut(channel).push_back(QueueEntry::new(task_id));
                (previous, touched)
            })
            .await?;

        if let Some(previous) = previous {
            debug!(%task_id, "Moved reference {} -> {}", previous, channel);
        } else {
            debug!(%task_id, "Enqueued to {}", channel);
        }
        self.notifier(channel).notify_one();
        Ok(())
    }

    /// Pop the head of `channel` without waiting
    pub async fn try_pop(&self, channel: Channel) -> OrchestratorResult<Option<QueueEntry>> {
        self.apply(|set| match set.get_mut(channel).pop_front() {
            Some(entry) => (Some(entry), vec![channel]),
            None => (None, Vec::new()),
        })
        .await
    }

    /// Pop the head of `channel`, waiting up to `timeout` for one to arrive
    pub async fn dequeue(
        &self,
        channel: Channel,
        timeout: Duration,
    ) -> OrchestratorResult<Option<QueueEntry>> {
        let deadline = deadline_after(timeout);
        loop {
            if let Some(entry) = self.try_pop(channel).await? {
                return Ok(Some(entry));
            }
            if !self.wait_until(channel, deadline).await {
                return Ok(None);
            }
        }
    }

    /// Move the head of main to the tail of processing in one step
    pub async fn try_claim(&self) -> OrchestratorResult<Option<QueueEntry>> {
        self.apply(|set| match set.get_mut(Channel::Main).pop_front() {
            Some(entry) => {
                let claimed = QueueEntry::new(entry.task_id);
                set.get_mut(Channel::Processing).push_back(claimed.clone());
                (Some(claimed), vec![Channel::Main, Channel::Processing])
            }
            None => (None, Vec::new()),
        })
        .await
    }

    /// Claim the head of main, waiting up to `timeout` for work
    pub async fn claim(&self, timeout: Duration) -> OrchestratorResult<Option<QueueEntry>> {
        let deadline = deadline_after(timeout);
        loop {
            if let Some(entry) = self.try_claim().await? {
                return Ok(Some(entry));
            }
            if !self.wait_until(Channel::Main, deadline).await {
                return Ok(None);
            }
        }
    }

    /// Wait until `channel` may hold entries, or `timeout` elapses.
    ///
    /// Returns `false` on timeout. Safe to cancel: no entry is taken.
    pub async fn wait_for_entries(&self, channel: Channel, timeout: Duration) -> bool {
        self.wait_until(channel, deadline_after(timeout)).await
    }

    async fn wait_until(&self, channel: Channel, deadline: Instant) -> bool {
        let notified = self.notifier(channel).notified();
        tokio::pin!(notified);
        // Register before checking so an enqueue in between is not missed
        notified.as_mut().enable();

        if self.length(channel).await > 0 {
            return true;
        }

        tokio::time::timeout_at(deadline, notified).await.is_ok()
    }

    /// Drop a finished task from processing
    pub async fn complete(&self, task_id: TaskId) -> OrchestratorResult<bool> {
        self.remove(Channel::Processing, task_id).await
    }

    /// Move a reference from `from` to the tail of `to`.
    ///
    /// Returns `false` when the task is not in `from`.
    pub async fn move_entry(
        &self,
        task_id: TaskId,
        from: Channel,
        to: Channel,
    ) -> OrchestratorResult<bool> {
        let moved = self
            .apply(|set| match set.take(from, task_id) {
                Some(_) => {
                    set.get_mut(to).push_back(QueueEntry::new(task_id));
                    (true, vec![from, to])
                }
                None => (false, Vec::new()),
            })
            .await?;

        if moved {
            debug!(%task_id, "Moved reference {} -> {}", from, to);
            self.notifier(to).notify_one();
        }
        Ok(moved)
    }

    /// Remove a reference from `channel`; `false` if it was not there
    pub async fn remove(&self, channel: Channel, task_id: TaskId) -> OrchestratorResult<bool> {
        self.apply(|set| match set.take(channel, task_id) {
            Some(_) => (true, vec![channel]),
            None => (false, Vec::new()),
        })
        .await
    }

    /// Channel currently holding the task, if any
    pub async fn contains(&self, task_id: TaskId) -> Option<Channel> {
        self.channels.lock().await.locate(task_id)
    }

    pub async fn length(&self, channel: Channel) -> usize {
        self.channels.lock().await.get(channel).len()
    }

    pub async fn peek(&self, channel: Channel) -> Option<QueueEntry> {
        self.channels.lock().await.get(channel).front().cloned()
    }

    /// Copy of a channel's entries in FIFO order
    pub async fn entries(&self, channel: Channel) -> Vec<QueueEntry> {
        self.channels.lock().await.get(channel).iter().cloned().collect()
    }

    pub async fn depths(&self) -> QueueDepths {
        let set = self.channels.lock().await;
        QueueDepths {
            main: set.get(Channel::Main).len(),
            processing: set.get(Channel::Processing).len(),
            dead_letter: set.get(Channel::DeadLetter).len(),
        }
    }

    /// Replace the content of every channel in one step.
    ///
    /// Later placements of an id already placed are ignored.
    pub async fn reconcile(&self, placements: Vec<(Channel, QueueEntry)>) -> OrchestratorResult<()> {
        let main_len = self
            .apply(|set| {
                let mut rebuilt = ChannelSet::default();
                let mut seen = std::collections::HashSet::new();
                for (channel, entry) in placements {
                    if seen.insert(entry.task_id) {
                        rebuilt.get_mut(channel).push_back(entry);
                    }
                }
                *set = rebuilt;
                (set.get(Channel::Main).len(), Channel::ALL.to_vec())
            })
            .await?;

        if main_len > 0 {
            self.notifier(Channel::Main).notify_waiters();
        }
        Ok(())
    }
}

/// `now + timeout`, clamped to roughly thirty years out
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS))
}

const FAR_FUTURE_SECS: u64 = 86400 * 365 * 30;
