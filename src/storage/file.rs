use super::StorageBackend;
use crate::env;
use crate::queue::{Channel, QueueEntry};
use crate::task::{Task, TaskId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// On-disk wrapper around every record.
///
/// The body is kept as raw JSON so the checksum covers the exact bytes on
/// disk rather than a re-encoding of the parsed value.
#[derive(Debug, Serialize, Deserialize)]
struct RecordEnvelope {
    checksum: String,
    body: Box<RawValue>,
}

/// JSON file backend with atomic writes.
///
/// Layout under the state directory:
/// - `tasks/<uuid>.json`: one record per task
/// - `queues/<channel>.json`: ordered entries of each channel
/// - `temp/`: scratch files renamed into place once synced
/// - `LOCK`: held exclusively while the backend is open
pub struct FileBackend {
    state_dir: PathBuf,
    checksum_validation: bool,
    _lock: StateLock,
}

impl FileBackend {
    /// Create the layout if needed and take the state directory lock
    pub fn open(state_dir: &Path, checksum_validation: bool) -> Result<Self> {
        for dir in [
            env::tasks_dir_path(state_dir),
            env::queues_dir_path(state_dir),
            env::temp_dir_path(state_dir),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }

        let lock = StateLock::acquire(&env::lock_file_path(state_dir))?;

        info!(
            "Opened file storage at {} (checksums {})",
            state_dir.display(),
            if checksum_validation { "on" } else { "off" }
        );

        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            checksum_validation,
            _lock: lock,
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    async fn write_record<T: Serialize>(&self, value: &T, final_path: &Path) -> Result<()> {
        let body = serde_json::value::to_raw_value(value).context("Failed to serialize record")?;
        let envelope = RecordEnvelope {
            checksum: calculate_checksum(body.get().as_bytes()),
            body,
        };
        let data = serde_json::to_vec_pretty(&envelope).context("Failed to encode record")?;

        let temp_path =
            env::temp_dir_path(&self.state_dir).join(format!("{}.tmp", uuid::Uuid::new_v4()));

        let mut file = async_fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create temp file {}", temp_path.display()))?;
        file.write_all(&data)
            .await
            .context("Failed to write record data")?;
        file.sync_all().await.context("Failed to sync record")?;
        drop(file);

        async_fs::rename(&temp_path, final_path)
            .await
            .with_context(|| format!("Failed to move record into {}", final_path.display()))?;

        Ok(())
    }

    async fn read_record<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let data = async_fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let envelope: RecordEnvelope =
            serde_json::from_slice(&data).context("Failed to parse record envelope")?;

        if self.checksum_validation {
            let calculated = calculate_checksum(envelope.body.get().as_bytes());
            if calculated != envelope.checksum {
                anyhow::bail!(
                    "Checksum validation failed (stored {}, calculated {})",
                    envelope.checksum,
                    calculated
                );
            }
        }

        serde_json::from_str(envelope.body.get()).context("Failed to decode record body")
    }

    /// Move an unreadable record out of the way so the next load skips it
    async fn quarantine(&self, path: &Path) {
        let mut target = path.as_os_str().to_owned();
        target.push(".");
        target.push(env::state::CORRUPT_SUFFIX);
        if let Err(e) = async_fs::rename(path, &target).await {
            warn!("Failed to quarantine {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn load_tasks(&self) -> Result<Vec<Task>> {
        let tasks_dir = env::tasks_dir_path(&self.state_dir);
        let mut entries = async_fs::read_dir(&tasks_dir)
            .await
            .with_context(|| format!("Failed to list {}", tasks_dir.display()))?;

        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match self.read_record::<Task>(&path).await {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!("Skipping unreadable task record {}: {:#}", path.display(), e);
                    self.quarantine(&path).await;
                }
            }
        }

        debug!("Loaded {} task records", tasks.len());
        Ok(tasks)
    }

    async fn put_task(&self, task: &Task) -> Result<()> {
        let path = env::task_file_path(&self.state_dir, &task.id);
        self.write_record(task, &path)
            .await
            .with_context(|| format!("Failed to persist task {}", task.id))
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<()> {
        let path = env::task_file_path(&self.state_dir, &task_id);
        match async_fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete task {}", task_id)),
        }
    }

    async fn load_channel(&self, channel: Channel) -> Result<Vec<QueueEntry>> {
        let path = env::channel_file_path(&self.state_dir, channel.as_str());
        if !async_fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        match self.read_record::<Vec<QueueEntry>>(&path).await {
            Ok(entries) => Ok(entries),
            Err(e) => {
                // Placement is rebuilt from task statuses during recovery
                warn!(
                    "Discarding unreadable {} channel snapshot: {:#}",
                    channel, e
                );
                self.quarantine(&path).await;
                Ok(Vec::new())
            }
        }
    }

    async fn save_channel(&self, channel: Channel, entries: &[QueueEntry]) -> Result<()> {
        let path = env::channel_file_path(&self.state_dir, channel.as_str());
        self.write_record(&entries, &path)
            .await
            .with_context(|| format!("Failed to persist {} channel", channel))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// CRC32 of the encoded body, hex encoded
fn calculate_checksum(data: &[u8]) -> String {
    let mut crc = flate2::Crc::new();
    crc.update(data);
    format!("{:08x}", crc.sum())
}

/// Exclusive advisory lock on the state directory
struct StateLock {
    file: File,
}

impl StateLock {
    fn acquire(path: &Path) -> Result<Self> {
        use fs2::FileExt;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        FileExt::try_lock_exclusive(&file).with_context(|| {
            format!(
                "State directory is locked by another process ({})",
                path.display()
            )
        })?;

        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
