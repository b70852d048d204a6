use super::*;
use crate::env;
use crate::queue::{Channel, QueueEntry};
use crate::task::{Task, TaskKind, TaskStatus};
use serde_json::json;
use tempfile::TempDir;

fn sample_task(kind: &str) -> Task {
    Task::new(TaskKind::new(kind), json!({"question_ids": [1, 2, 3]}))
}

#[tokio::test]
async fn test_file_backend_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FileBackend::open(temp_dir.path(), true).unwrap();

    let task = sample_task("grade");
    backend.put_task(&task).await.unwrap();

    assert!(env::task_file_path(temp_dir.path(), &task.id).exists());
    let loaded = backend.load_tasks().await.unwrap();
    assert_eq!(loaded, vec![task.clone()]);

    let entries = vec![QueueEntry::new(task.id)];
    backend.save_channel(Channel::Main, &entries).await.unwrap();
    assert_eq!(backend.load_channel(Channel::Main).await.unwrap(), entries);
    assert!(
        backend
            .load_channel(Channel::DeadLetter)
            .await
            .unwrap()
            .is_empty()
    );

    backend.delete_task(task.id).await.unwrap();
    // Deleting twice is fine
    backend.delete_task(task.id).await.unwrap();
    assert!(backend.load_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_file_backend_overwrites_record() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FileBackend::open(temp_dir.path(), true).unwrap();

    let mut task = sample_task("generate_paper");
    backend.put_task(&task).await.unwrap();
    task.status = TaskStatus::Processing;
    backend.put_task(&task).await.unwrap();

    let loaded = backend.load_tasks().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].status, TaskStatus::Processing);

    // Temp files never linger after a successful write
    let leftovers = std::fs::read_dir(env::temp_dir_path(temp_dir.path()))
        .unwrap()
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_float_payloads_survive_reload() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FileBackend::open(temp_dir.path(), true).unwrap();

    let mut scores = vec![0.9749512713538497, 0.1 + 0.2, 1e-300, 123456.789];
    scores.extend((1..200).map(|i| 1.0 / f64::from(i) + f64::from(i) * 0.0137));

    let mut tasks = Vec::new();
    for score in scores {
        let task = Task::new(TaskKind::new("grade"), json!({ "score": score }));
        backend.put_task(&task).await.unwrap();
        tasks.push(task);
    }

    let mut loaded = backend.load_tasks().await.unwrap();
    assert_eq!(loaded.len(), tasks.len());
    loaded.sort_by_key(|t| t.id);
    tasks.sort_by_key(|t| t.id);
    assert_eq!(loaded, tasks);

    let quarantined = std::fs::read_dir(env::tasks_dir_path(temp_dir.path()))
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .path()
                .to_string_lossy()
                .ends_with(".corrupt")
        })
        .count();
    assert_eq!(quarantined, 0);
}

#[tokio::test]
async fn test_tampered_record_is_quarantined() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FileBackend::open(temp_dir.path(), true).unwrap();

    let good = sample_task("grade");
    let bad = sample_task("grade");
    backend.put_task(&good).await.unwrap();
    backend.put_task(&bad).await.unwrap();

    let bad_path = env::task_file_path(temp_dir.path(), &bad.id);
    let content = std::fs::read_to_string(&bad_path).unwrap();
    std::fs::write(&bad_path, content.replace("\"grade\"", "\"sync_roadmap\"")).unwrap();

    let loaded = backend.load_tasks().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, good.id);
    assert!(!bad_path.exists());
    assert!(bad_path.with_extension("json.corrupt").exists());
}

#[tokio::test]
async fn test_checksum_validation_can_be_disabled() {
    let temp_dir = TempDir::new().unwrap();
    let task = sample_task("grade");
    {
        let backend = FileBackend::open(temp_dir.path(), true).unwrap();
        backend.put_task(&task).await.unwrap();
    }

    let path = env::task_file_path(temp_dir.path(), &task.id);
    let content = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, content.replace("\"grade\"", "\"sync_roadmap\"")).unwrap();

    let backend = FileBackend::open(temp_dir.path(), false).unwrap();
    let loaded = backend.load_tasks().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].kind.as_str(), "sync_roadmap");
}

#[tokio::test]
async fn test_garbage_channel_snapshot_is_discarded() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FileBackend::open(temp_dir.path(), true).unwrap();

    let path = env::channel_file_path(temp_dir.path(), "main");
    std::fs::write(&path, b"not json").unwrap();

    assert!(backend.load_channel(Channel::Main).await.unwrap().is_empty());
    assert!(!path.exists());
}

#[test]
fn test_state_dir_is_exclusive() {
    let temp_dir = TempDir::new().unwrap();

    let first = FileBackend::open(temp_dir.path(), true).unwrap();
    let second = FileBackend::open(temp_dir.path(), true);
    assert!(second.is_err());

    drop(first);
    assert!(FileBackend::open(temp_dir.path(), true).is_ok());
}

#[tokio::test]
async fn test_memory_backend_clones_share_state() {
    let backend = MemoryBackend::new();
    let clone = backend.clone();

    let task = sample_task("grade");
    backend.put_task(&task).await.unwrap();
    assert_eq!(clone.load_tasks().await.unwrap(), vec![task]);

    clone.set_fail_writes(true);
    assert!(backend.put_task(&sample_task("grade")).await.is_err());
    assert_eq!(backend.name(), "memory");
}

#[tokio::test]
async fn test_open_backend_selects_kind() {
    let temp_dir = TempDir::new().unwrap();

    let file = open_backend(StorageKind::File, temp_dir.path(), true).unwrap();
    assert_eq!(file.name(), "file");

    let memory = open_backend(StorageKind::Memory, temp_dir.path(), true).unwrap();
    assert_eq!(memory.name(), "memory");
}
