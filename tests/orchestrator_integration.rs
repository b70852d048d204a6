//! End-to-end behavior of the orchestrator on the in-memory backend.
//!
//! Tests that involve backoff delays or handler timeouts run on a paused
//! clock, so tokio skips ahead whenever every task is idle.

use aurora_orchestrator::{
    EventKind, EventStream, HandlerFailure, Orchestrator, OrchestratorConfig, RetryPolicy,
    TaskEvent, TaskId, TaskStatus, handler_fn,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::in_memory();
    config.default_retry = RetryPolicy::new(3).with_delays(1.0, 2.0, 10.0);
    config.dequeue_timeout_secs = 1;
    config
}

async fn open(config: OrchestratorConfig) -> Orchestrator {
    Orchestrator::open(config).await.expect("open orchestrator")
}

/// Events for `task_id` up to and including the first one of `until`
async fn events_until(stream: &mut EventStream, task_id: TaskId, until: EventKind) -> Vec<EventKind> {
    let mut seen = Vec::new();
    while let Some(event) = stream.recv().await {
        if event.task_id != task_id {
            continue;
        }
        seen.push(event.kind);
        if event.kind == until {
            return seen;
        }
    }
    panic!("event stream closed before {}", until);
}

async fn next_of(stream: &mut EventStream, task_id: TaskId) -> TaskEvent {
    loop {
        let event = stream.recv().await.expect("event stream closed");
        if event.task_id == task_id {
            return event;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_flaky_handler_succeeds_on_third_attempt() {
    let orchestrator = open(test_config()).await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    orchestrator.register_handler(
        "grade",
        handler_fn(move |ctx| {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                assert_eq!(ctx.attempt, call);
                if call < 3 {
                    Err(HandlerFailure::recoverable("grader busy"))
                } else {
                    Ok(json!({ "score": 91 }))
                }
            }
        }),
    );
    let mut events = orchestrator.subscribe_all();
    orchestrator.start(2).await;

    let task_id = orchestrator.submit("grade", json!({ "submission": 1 })).await.unwrap();
    let seen = events_until(&mut events, task_id, EventKind::Completed).await;

    assert_eq!(
        seen,
        vec![
            EventKind::Created,
            EventKind::Started,
            EventKind::Failed,
            EventKind::Started,
            EventKind::Failed,
            EventKind::Started,
            EventKind::Completed,
        ]
    );

    let task = orchestrator.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.output, Some(json!({ "score": 91 })));
    assert!(task.error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    orchestrator.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unknown_kind_is_dead_lettered_without_attempts() {
    let orchestrator = open(test_config()).await;
    let mut events = orchestrator.subscribe_all();
    orchestrator.start(1).await;

    let task_id = orchestrator.submit("mystery", json!({})).await.unwrap();
    let seen = events_until(&mut events, task_id, EventKind::DeadLettered).await;

    assert_eq!(seen, vec![EventKind::Created, EventKind::DeadLettered]);
    let task = orchestrator.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::DeadLettered);
    assert_eq!(task.attempts, 0);
    assert_eq!(task.error.as_deref(), Some("no handler registered for type mystery"));
    assert_eq!(orchestrator.dead_letters().count().await, 1);

    orchestrator.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_single_attempt_policy_dead_letters_after_first_failure() {
    let config = test_config().with_retry_policy("once", RetryPolicy::new(1));
    let orchestrator = open(config).await;
    orchestrator.register_handler(
        "once",
        handler_fn(|_| async { Err::<Value, _>(HandlerFailure::recoverable("boom")) }),
    );
    let mut events = orchestrator.subscribe_all();
    orchestrator.start(1).await;

    let task_id = orchestrator.submit("once", json!({})).await.unwrap();
    let seen = events_until(&mut events, task_id, EventKind::DeadLettered).await;

    assert_eq!(
        seen,
        vec![
            EventKind::Created,
            EventKind::Started,
            EventKind::Failed,
            EventKind::DeadLettered,
        ]
    );
    let task = orchestrator.get_task(task_id).await.unwrap();
    assert_eq!(task.attempts, 1);
    assert_eq!(
        task.error.as_deref(),
        Some("retries exhausted after 1 attempts: boom")
    );

    orchestrator.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_dead_letters_raise_one_alert() {
    let orchestrator = open(test_config()).await;
    orchestrator.register_handler(
        "broken",
        handler_fn(|_| async { Err::<Value, _>(HandlerFailure::non_recoverable("schema mismatch")) }),
    );
    let mut dead_lettered = orchestrator.subscribe(EventKind::DeadLettered);
    let mut alerts = orchestrator.subscribe(EventKind::Alert);
    orchestrator.start(1).await;

    for i in 0..6 {
        orchestrator.submit("broken", json!({ "n": i })).await.unwrap();
    }
    for _ in 0..6 {
        dead_lettered.recv().await.unwrap();
    }

    let alert = alerts.try_recv().expect("alert raised");
    assert_eq!(alert.task_kind.as_str(), "broken");
    assert_eq!(alert.snapshot["consecutive_dead_letters"], json!(5));
    assert_eq!(alert.snapshot["threshold"], json!(5));
    assert_eq!(alert.snapshot["last_error"], json!("schema mismatch"));
    assert!(alerts.try_recv().is_none());

    orchestrator.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_retried() {
    let mut config = test_config();
    config.handler_timeouts.insert("render".to_string(), 2);
    let orchestrator = open(config).await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    orchestrator.register_handler(
        "render",
        handler_fn(move |_| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(json!("rendered"))
            }
        }),
    );
    let mut events = orchestrator.subscribe_all();
    orchestrator.start(1).await;

    let task_id = orchestrator.submit("render", json!({})).await.unwrap();

    let failed = loop {
        let event = next_of(&mut events, task_id).await;
        if event.kind == EventKind::Failed {
            break event;
        }
    };
    assert_eq!(failed.error.as_deref(), Some("handler timed out after 2s"));

    events_until(&mut events, task_id, EventKind::Completed).await;
    assert_eq!(orchestrator.get_task(task_id).await.unwrap().attempts, 2);

    orchestrator.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_panicking_handler_is_retried() {
    let orchestrator = open(test_config()).await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    orchestrator.register_handler(
        "audit",
        handler_fn(move |_| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    panic!("ledger corrupted");
                }
                Ok(json!("clean"))
            }
        }),
    );
    let mut events = orchestrator.subscribe_all();
    orchestrator.start(1).await;

    let task_id = orchestrator.submit("audit", json!({})).await.unwrap();
    let seen = events_until(&mut events, task_id, EventKind::Completed).await;

    assert_eq!(seen.iter().filter(|k| **k == EventKind::Failed).count(), 1);
    let task = orchestrator.get_task(task_id).await.unwrap();
    assert_eq!(task.attempts, 2);
    assert_eq!(task.status, TaskStatus::Completed);

    orchestrator.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dead_letter_retry_is_processed_again() {
    let orchestrator = open(test_config()).await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    orchestrator.register_handler(
        "grade",
        handler_fn(move |_| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    Err(HandlerFailure::non_recoverable("rubric missing"))
                } else {
                    Ok(json!({ "score": 50 }))
                }
            }
        }),
    );
    let mut events = orchestrator.subscribe_all();
    orchestrator.start(1).await;

    let task_id = orchestrator.submit("grade", json!({})).await.unwrap();
    events_until(&mut events, task_id, EventKind::DeadLettered).await;

    let requeued = orchestrator.dead_letters().retry(task_id).await.unwrap();
    assert_eq!(requeued.status, TaskStatus::Queued);
    assert_eq!(requeued.attempts, 0);

    let seen = events_until(&mut events, task_id, EventKind::Completed).await;
    assert_eq!(seen[0], EventKind::Retried);

    let task = orchestrator.get_task(task_id).await.unwrap();
    assert_eq!(task.attempts, 1);
    assert_eq!(task.manual_retries, 1);
    assert_eq!(orchestrator.dead_letters().count().await, 0);

    orchestrator.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_status_reports_pool_and_queues() {
    let orchestrator = open(test_config()).await;
    orchestrator.register_handler("ok", handler_fn(|_| async { Ok(json!(true)) }));
    orchestrator.register_handler(
        "bad",
        handler_fn(|_| async { Err::<Value, _>(HandlerFailure::non_recoverable("nope")) }),
    );
    let mut completed = orchestrator.subscribe(EventKind::Completed);
    let mut dead_lettered = orchestrator.subscribe(EventKind::DeadLettered);

    assert!(orchestrator.start(3).await);
    assert!(!orchestrator.start(3).await);

    let ok = orchestrator.submit("ok", json!({})).await.unwrap();
    let bad = orchestrator.submit("bad", json!({})).await.unwrap();
    next_of(&mut completed, ok).await;
    next_of(&mut dead_lettered, bad).await;

    let status = orchestrator.status().await;
    assert!(status.running);
    assert_eq!(status.storage, "memory");
    assert_eq!(status.workers, 3);
    assert_eq!(status.queue_depths.main, 0);
    assert_eq!(status.queue_depths.dead_letter, 1);
    assert_eq!(status.task_counts[&TaskStatus::Completed], 1);
    assert_eq!(status.task_counts[&TaskStatus::DeadLettered], 1);
    assert!((status.recent_failure_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(status.registered_kinds.len(), 2);

    orchestrator.stop(Duration::from_secs(5)).await.unwrap();
    let status = orchestrator.status().await;
    assert!(!status.running);
    assert_eq!(status.workers, 0);
    assert_eq!(status.worker_utilization, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_leaves_unfinished_tasks_in_main() {
    let mut config = test_config();
    config.stop_grace_secs = 1;
    let orchestrator = open(config).await;
    orchestrator.register_handler(
        "slow",
        handler_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(Value::Null)
        }),
    );
    let mut started = orchestrator.subscribe(EventKind::Started);
    orchestrator.start(2).await;

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(orchestrator.submit("slow", json!({})).await.unwrap());
    }
    started.recv().await.unwrap();
    started.recv().await.unwrap();

    let stopping = tokio::time::Instant::now();
    let report = orchestrator.stop_default().await.unwrap();
    assert_eq!(report.interrupted, 2);
    assert!(stopping.elapsed() >= Duration::from_secs(1));
    assert!(stopping.elapsed() < Duration::from_secs(600));

    let status = orchestrator.status().await;
    assert_eq!(status.queue_depths.main, 6);
    assert_eq!(status.queue_depths.processing, 0);
    for id in ids {
        let task = orchestrator.get_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempts, 0);
    }
}

#[tokio::test]
async fn test_purge_completed() {
    let orchestrator = open(test_config()).await;
    orchestrator.register_handler("ok", handler_fn(|_| async { Ok(json!(1)) }));
    let mut completed = orchestrator.subscribe(EventKind::Completed);
    orchestrator.start(1).await;

    let task_id = orchestrator.submit("ok", json!({})).await.unwrap();
    completed.recv().await.unwrap();
    orchestrator.stop(Duration::from_secs(5)).await.unwrap();

    assert_eq!(orchestrator.purge_completed(chrono::Duration::days(30)).await.unwrap(), 0);
    assert_eq!(orchestrator.purge_completed(chrono::Duration::seconds(-1)).await.unwrap(), 1);
    assert!(orchestrator.get_task(task_id).await.is_err());
}
