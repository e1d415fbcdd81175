//! Integration tests for the task engine.
//!
//! Each test builds a real engine over a temp directory and drives real
//! `sh` subprocesses through the full submit → admit → supervise → finalize
//! lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use uuid::Uuid;

use runq::config::EngineConfig;
use runq::engine::TaskEngine;
use runq::error::{Error, NotFoundError, ValidationError};
use runq::stager::Upload;
use runq::store::{MemoryTaskStore, TaskStore};
use runq::task::{Task, TaskStatus};

/// Maximum time any test is allowed to wait for a task to settle.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Engine over a temp dir, running scripts with `sh`.
async fn engine_with(max_concurrent: usize) -> (tempfile::TempDir, Arc<TaskEngine>) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::new(dir.path());
    config.max_concurrent = max_concurrent;
    config.interpreter = "sh".to_string();
    config.grace_period = Duration::from_millis(300);

    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let engine = TaskEngine::new(config, store).await.unwrap();
    (dir, engine)
}

/// Poll until the task reaches a terminal status.
async fn wait_terminal(engine: &TaskEngine, id: Uuid) -> Task {
    timeout(TEST_TIMEOUT, async {
        loop {
            let task = engine.get_task(id).await.unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("task did not reach a terminal status in time")
}

/// Poll until the task is RUNNING (or already past it).
async fn wait_running(engine: &TaskEngine, id: Uuid) -> Task {
    timeout(TEST_TIMEOUT, async {
        loop {
            let task = engine.get_task(id).await.unwrap();
            if task.status != TaskStatus::Queued {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task was never admitted")
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_run_produces_output_artifact() {
    let (_dir, engine) = engine_with(2).await;
    engine
        .register_script("writer", "writes ok", b"printf ok > output/result.txt")
        .await
        .unwrap();

    let task = engine.submit("writer", "{}", Vec::new()).await.unwrap();
    let done = wait_terminal(&engine, task.id).await;

    assert_eq!(done.status, TaskStatus::Succeeded);
    assert_eq!(done.exit_code, Some(0));
    assert!(done.started_at.is_some());
    assert!(done.ended_at.is_some());
    assert_eq!(
        std::fs::read_to_string(done.task_dir.join("output/result.txt")).unwrap(),
        "ok"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_run_records_exit_code_and_log() {
    let (_dir, engine) = engine_with(2).await;
    engine
        .register_script("broken", "", b"echo boom 1>&2; exit 1")
        .await
        .unwrap();

    let task = engine.submit("broken", "{}", Vec::new()).await.unwrap();
    let done = wait_terminal(&engine, task.id).await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.exit_code, Some(1));

    let log = engine.read_log(task.id, None).await.unwrap();
    assert!(log.contains("boom"), "stderr should land in the log: {log:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn placeholders_resolve_to_staged_files() {
    let (_dir, engine) = engine_with(2).await;
    // The script reads the path stored under key "a" out of arg_file.json
    // and copies that staged file into output/.
    engine
        .register_script(
            "consume",
            "",
            b"path=$(sed -n 's/.*\"a\": \"\\(.*\\)\".*/\\1/p' arg_file.json); cp \"$path\" output/copied",
        )
        .await
        .unwrap();

    let uploads = vec![
        Upload::new("first.txt", b"payload-one".to_vec()),
        Upload::new("second.txt", b"payload-two".to_vec()),
    ];
    let task = engine
        .submit("consume", r#"{"a": "<file1>", "b": "<file2>"}"#, uploads)
        .await
        .unwrap();
    let done = wait_terminal(&engine, task.id).await;

    assert_eq!(done.status, TaskStatus::Succeeded);
    assert_eq!(
        std::fs::read_to_string(done.task_dir.join("output/copied")).unwrap(),
        "payload-one"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unresolved_placeholder_blocks_submission() {
    let (_dir, engine) = engine_with(2).await;
    engine.register_script("noop", "", b"exit 0").await.unwrap();

    let uploads = vec![
        Upload::new("a", b"1".to_vec()),
        Upload::new("b", b"2".to_vec()),
    ];
    let err = engine
        .submit("noop", r#"{"x": "<file3>"}"#, uploads)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Validation(ValidationError::PlaceholderOutOfRange { index: 3, .. })
    ));
    assert!(engine.list_tasks().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_script_blocks_submission() {
    let (_dir, engine) = engine_with(2).await;
    let err = engine.submit("ghost", "{}", Vec::new()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::NotFound(NotFoundError::Script { .. })
    ));
    assert!(engine.list_tasks().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_argument_document_blocks_submission() {
    let (_dir, engine) = engine_with(2).await;
    engine.register_script("noop", "", b"exit 0").await.unwrap();

    let err = engine
        .submit("noop", "not json at all", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::MalformedArgDocument(_))
    ));
    assert!(engine.list_tasks().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn fifo_admission_under_single_slot() {
    let (_dir, engine) = engine_with(1).await;
    engine
        .register_script("slow", "", b"sleep 0.3")
        .await
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(engine.submit("slow", "{}", Vec::new()).await.unwrap().id);
    }

    // While anything is still active, never more than one task runs.
    let all_terminal = timeout(TEST_TIMEOUT, async {
        loop {
            let tasks = engine.list_tasks().await.unwrap();
            let running = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Running)
                .count();
            assert!(running <= 1, "cap violated: {running} tasks running");
            if tasks.iter().all(|t| t.status.is_terminal()) {
                return tasks;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tasks did not finish in time");

    // Admission order matches submission order.
    let mut started: Vec<(Uuid, chrono::DateTime<chrono::Utc>)> = all_terminal
        .iter()
        .map(|t| (t.id, t.started_at.unwrap()))
        .collect();
    started.sort_by_key(|(_, at)| *at);
    let admitted: Vec<Uuid> = started.into_iter().map(|(id, _)| id).collect();
    assert_eq!(admitted, ids);

    assert_eq!(engine.running_count().await, 0);
    assert_eq!(engine.queued_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn burst_drains_through_repeated_admission() {
    // Finishing supervisors re-admit from the queue; a burst larger than
    // the cap drains across several of those handoffs.
    let (_dir, engine) = engine_with(2).await;
    engine
        .register_script("quick", "", b"sleep 0.05")
        .await
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(engine.submit("quick", "{}", Vec::new()).await.unwrap().id);
    }

    for id in ids {
        let done = wait_terminal(&engine, id).await;
        assert_eq!(done.status, TaskStatus::Succeeded);
    }
    assert_eq!(engine.running_count().await, 0);
    assert_eq!(engine.queued_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_queued_task_before_admission() {
    let (_dir, engine) = engine_with(1).await;
    engine
        .register_script("slow", "", b"sleep 5")
        .await
        .unwrap();
    engine
        .register_script("queued", "", b"exit 0")
        .await
        .unwrap();

    let blocker = engine.submit("slow", "{}", Vec::new()).await.unwrap();
    wait_running(&engine, blocker.id).await;
    let victim = engine.submit("queued", "{}", Vec::new()).await.unwrap();

    let status = engine.cancel(victim.id).await.unwrap();
    assert_eq!(status, TaskStatus::Cancelled);

    let record = engine.get_task(victim.id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert!(record.started_at.is_none(), "never admitted");
    assert!(record.exit_code.is_none());

    engine.cancel(blocker.id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_running_task_terminates_process() {
    let (_dir, engine) = engine_with(1).await;
    engine
        .register_script("sleeper", "", b"sleep 30")
        .await
        .unwrap();

    let task = engine.submit("sleeper", "{}", Vec::new()).await.unwrap();
    wait_running(&engine, task.id).await;

    let status = timeout(TEST_TIMEOUT, engine.cancel(task.id))
        .await
        .expect("cancel should not hang")
        .unwrap();
    assert_eq!(status, TaskStatus::Cancelled);

    let record = engine.get_task(task.id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert!(record.exit_code.is_none(), "exit code discarded on cancel");
    assert_eq!(engine.running_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_twice_is_a_noop() {
    let (_dir, engine) = engine_with(1).await;
    engine
        .register_script("sleeper", "", b"sleep 30")
        .await
        .unwrap();

    let task = engine.submit("sleeper", "{}", Vec::new()).await.unwrap();
    wait_running(&engine, task.id).await;

    let first = engine.cancel(task.id).await.unwrap();
    let second = engine.cancel(task.id).await.unwrap();
    assert_eq!(first, TaskStatus::Cancelled);
    assert_eq!(second, TaskStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_slot_is_released_to_next_task() {
    let (_dir, engine) = engine_with(1).await;
    engine
        .register_script("sleeper", "", b"sleep 30")
        .await
        .unwrap();
    engine.register_script("quick", "", b"exit 0").await.unwrap();

    let blocker = engine.submit("sleeper", "{}", Vec::new()).await.unwrap();
    wait_running(&engine, blocker.id).await;
    let follower = engine.submit("quick", "{}", Vec::new()).await.unwrap();

    engine.cancel(blocker.id).await.unwrap();

    let done = wait_terminal(&engine, follower.id).await;
    assert_eq!(done.status, TaskStatus::Succeeded);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_unknown_task_is_not_found() {
    let (_dir, engine) = engine_with(1).await;
    let err = engine.cancel(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(NotFoundError::Task { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_interpreter_fails_task_without_blocking_queue() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::new(dir.path());
    config.max_concurrent = 1;
    config.interpreter = "runq-no-such-interpreter".to_string();

    let engine = TaskEngine::new(config, Arc::new(MemoryTaskStore::new()))
        .await
        .unwrap();
    engine.register_script("any", "", b"exit 0").await.unwrap();

    let task = engine.submit("any", "{}", Vec::new()).await.unwrap();
    let done = wait_terminal(&engine, task.id).await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done.exit_code.is_none());

    let log = engine.read_log(task.id, None).await.unwrap();
    assert!(
        log.contains("Failed to start task process"),
        "spawn diagnostic should be in the log: {log:?}"
    );
    assert_eq!(engine.running_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn read_log_tails_last_lines() {
    let (_dir, engine) = engine_with(1).await;
    engine
        .register_script("chatty", "", b"for i in 1 2 3 4 5; do echo line$i; done")
        .await
        .unwrap();

    let task = engine.submit("chatty", "{}", Vec::new()).await.unwrap();
    wait_terminal(&engine, task.id).await;

    let tail = engine.read_log(task.id, Some(2)).await.unwrap();
    assert_eq!(tail, "line4\nline5");
}

#[tokio::test(flavor = "multi_thread")]
async fn recover_fails_over_stale_running_tasks() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryTaskStore::new());

    // A record left RUNNING by a previous process.
    let stale_dir = dir.path().join("tasks").join("stale");
    std::fs::create_dir_all(&stale_dir).unwrap();
    let mut stale = Task::new(Uuid::new_v4(), "old", &stale_dir);
    stale.transition_to(TaskStatus::Running).unwrap();
    store.create(stale.clone()).await.unwrap();

    let mut config = EngineConfig::new(dir.path());
    config.interpreter = "sh".to_string();
    let engine = TaskEngine::new(config, store).await.unwrap();

    assert_eq!(engine.recover().await.unwrap(), 1);

    let record = engine.get_task(stale.id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    let log = engine.read_log(stale.id, None).await.unwrap();
    assert!(log.contains("interrupted"));

    // Recovery is idempotent.
    assert_eq!(engine.recover().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn environment_identifies_the_task() {
    let (_dir, engine) = engine_with(1).await;
    engine
        .register_script("env", "", b"printf '%s' \"$RUNQ_TASK_ID\" > output/id.txt")
        .await
        .unwrap();

    let task = engine.submit("env", "{}", Vec::new()).await.unwrap();
    let done = wait_terminal(&engine, task.id).await;

    assert_eq!(done.status, TaskStatus::Succeeded);
    assert_eq!(
        std::fs::read_to_string(done.task_dir.join("output/id.txt")).unwrap(),
        task.id.to_string()
    );
}
