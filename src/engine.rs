//! Task engine: submission, admission, supervision, and cancellation.
//!
//! The engine owns the single serialization domain (one mutex around
//! `SchedulerState`) and spawns one supervisor task per admitted task.
//! Supervisors block only on their own child process; submissions, status
//! queries, log reads, and cancellations never wait on a running process.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cancel::{self, CancelDecision};
use crate::config::EngineConfig;
use crate::error::{Error, NotFoundError, ProcessError, Result, StoreError};
use crate::registry::ScriptRegistry;
use crate::runner::{ProcessRunner, RunOutcome};
use crate::scheduler::{RunningSlot, SchedulerState};
use crate::stager::{FileStager, StagedTask, Upload, LOG_FILE};
use crate::store::TaskStore;
use crate::task::{Task, TaskStatus};

/// The run queue engine.
pub struct TaskEngine {
    registry: ScriptRegistry,
    stager: FileStager,
    store: Arc<dyn TaskStore>,
    runner: ProcessRunner,
    sched: Mutex<SchedulerState>,
    /// Self-handle so supervisors spawned from `&self` methods can own an
    /// `Arc` back to the engine.
    me: Weak<TaskEngine>,
}

impl TaskEngine {
    /// Build an engine over `store`, creating the on-disk layout under
    /// `config.base_dir`.
    pub async fn new(config: EngineConfig, store: Arc<dyn TaskStore>) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = ScriptRegistry::open(config.scripts_dir()).await?;
        let stager = FileStager::open(config.tasks_dir()).await?;
        let runner = ProcessRunner::new(config.interpreter.clone(), config.grace_period);

        Ok(Arc::new_cyclic(|me| Self {
            registry,
            stager,
            store,
            runner,
            sched: Mutex::new(SchedulerState::new(config.max_concurrent)),
            me: me.clone(),
        }))
    }

    /// The script registry backing this engine.
    pub fn registry(&self) -> &ScriptRegistry {
        &self.registry
    }

    /// Register a script, replacing any prior entry with the same name.
    pub async fn register_script(
        &self,
        name: &str,
        description: &str,
        source: &[u8],
    ) -> Result<()> {
        self.registry.register(name, description, source).await?;
        Ok(())
    }

    /// Submit a run of a registered script.
    ///
    /// Stages the task directory (atomically published), creates the
    /// QUEUED record, and enqueues for admission. Staging or validation
    /// failures abort synchronously and leave no task record behind.
    pub async fn submit(
        &self,
        script_name: &str,
        raw_args: &str,
        uploads: Vec<Upload>,
    ) -> Result<Task> {
        let script = self.registry.resolve(script_name).await?;
        let task_id = Uuid::new_v4();

        let StagedTask { task_dir, .. } = self
            .stager
            .stage(task_id, &script, raw_args, &uploads)
            .await?;

        let task = Task::new(task_id, script_name, &task_dir);
        self.store.create(task.clone()).await?;

        tracing::info!(
            task_id = %task_id,
            script = %script_name,
            uploads = uploads.len(),
            "Task submitted"
        );

        self.sched.lock().await.enqueue(task_id);
        self.pump().await;

        Ok(task)
    }

    /// Latest persisted record for a task.
    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| NotFoundError::Task { id }.into())
    }

    /// All tasks ordered by creation time.
    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.store.list().await?)
    }

    /// Tail of the task's combined log. `lines` limits to the last N
    /// lines; a missing log (task not started yet) reads as empty.
    pub async fn read_log(&self, id: Uuid, lines: Option<usize>) -> Result<String> {
        let task = self.get_task(id).await?;
        let path = task.task_dir.join(LOG_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        match lines {
            Some(n) => {
                let all: Vec<&str> = content.lines().collect();
                let start = all.len().saturating_sub(n);
                Ok(all[start..].join("\n"))
            }
            None => Ok(content),
        }
    }

    /// Cancel a task.
    ///
    /// Queued tasks are removed before they can start; running tasks get
    /// the two-phase termination signal and the call waits until the
    /// supervisor finalizes. Terminal tasks are a no-op returning their
    /// current status. If the process exits naturally while cancellation
    /// is in flight, the first finalizer wins and the winning status is
    /// returned.
    pub async fn cancel(&self, id: Uuid) -> Result<TaskStatus> {
        let decision = {
            let mut sched = self.sched.lock().await;
            cancel::decide(&mut sched, id)
        };

        match decision {
            CancelDecision::DequeuedBeforeStart => {
                let task = self
                    .store
                    .update(id, TaskStatus::Cancelled, None, None, Some(Utc::now()))
                    .await?;
                tracing::info!(task_id = %id, "Cancelled queued task");
                Ok(task.status)
            }
            CancelDecision::SignalRunning(slot) => {
                tracing::info!(task_id = %id, "Requesting termination of running task");
                slot.cancel.cancel();
                slot.done.cancelled().await;
                if let Some(fatal) = slot.fatal.get() {
                    return Err(fatal.clone().into());
                }
                let task = self.get_task(id).await?;
                Ok(task.status)
            }
            CancelDecision::NotHeld => {
                // Terminal, unknown, or a submission that has not reached
                // the queue yet. The store's transition check arbitrates.
                match self
                    .store
                    .update(id, TaskStatus::Cancelled, None, None, Some(Utc::now()))
                    .await
                {
                    Ok(task) => Ok(task.status),
                    Err(StoreError::InvalidTransition { .. }) => {
                        let task = self.get_task(id).await?;
                        Ok(task.status)
                    }
                    Err(StoreError::NotFound { .. }) => Err(NotFoundError::Task { id }.into()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Fail over task records left RUNNING by a previous process; their
    /// processes cannot be re-attached. Returns the number of tasks marked
    /// FAILED. Call once at startup, before submitting.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for task in self.store.list().await? {
            if task.status != TaskStatus::Running {
                continue;
            }
            self.append_log(&task, "Task interrupted: engine restarted while it was running")
                .await;
            self.store
                .update(task.id, TaskStatus::Failed, None, None, Some(Utc::now()))
                .await?;
            tracing::warn!(task_id = %task.id, "Recovered stale running task as failed");
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Number of tasks currently holding a running slot.
    pub async fn running_count(&self) -> usize {
        self.sched.lock().await.running_count()
    }

    /// Number of tasks waiting for admission.
    pub async fn queued_count(&self) -> usize {
        self.sched.lock().await.queued_count()
    }

    /// Admit queued tasks into free slots and spawn their supervisors.
    ///
    /// Returns a boxed future instead of being an `async fn`: supervisors
    /// await `pump` when they finish and `pump` builds supervisor futures,
    /// so the future type needs an indirection to stay non-recursive.
    fn pump(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            // The engine is behind an `Arc`; during teardown the upgrade can
            // miss, in which case there is nobody left to supervise for.
            let Some(engine) = self.me.upgrade() else {
                return;
            };
            loop {
                let admitted = self.sched.lock().await.admit_next();
                if admitted.is_empty() {
                    return;
                }

                let mut released_any = false;
                for (id, slot) in admitted {
                    match self
                        .store
                        .update(id, TaskStatus::Running, None, Some(Utc::now()), None)
                        .await
                    {
                        Ok(task) => {
                            tracing::info!(task_id = %id, script = %task.script_name, "Task admitted");
                            tokio::spawn(Arc::clone(&engine).supervise(task, slot));
                        }
                        Err(e) => {
                            // Lost the race with a cancellation that hit before
                            // the task reached the queue, or a store fault.
                            tracing::warn!(task_id = %id, error = %e, "Admission aborted");
                            self.sched.lock().await.release(id);
                            released_any = true;
                        }
                    }
                }

                if !released_any {
                    return;
                }
            }
        })
    }

    /// Per-task supervisor: runs the process to completion, persists the
    /// terminal status exactly once, then frees the slot.
    async fn supervise(self: Arc<Self>, task: Task, slot: RunningSlot) {
        let outcome = self.run_task(&task, &slot.cancel).await;

        let (status, exit_code) = match outcome {
            Ok(RunOutcome::Exited { code: Some(0) }) => (TaskStatus::Succeeded, Some(0)),
            Ok(RunOutcome::Exited { code: Some(code) }) => (TaskStatus::Failed, Some(code)),
            Ok(RunOutcome::Exited { code: None }) => {
                self.append_log(&task, "Task process terminated by a signal")
                    .await;
                (TaskStatus::Failed, None)
            }
            Ok(RunOutcome::Cancelled) => (TaskStatus::Cancelled, None),
            // Diagnostic already appended by run_task.
            Err(Error::Process(ProcessError::Spawn { .. })) => (TaskStatus::Failed, None),
            Err(Error::Cancel(fatal)) => {
                tracing::error!(task_id = %task.id, error = %fatal, "Termination not confirmed");
                self.append_log(&task, &format!("Fatal cancellation error: {fatal}"))
                    .await;
                let _ = slot.fatal.set(fatal);
                (TaskStatus::Failed, None)
            }
            Err(e) => {
                self.append_log(&task, &format!("Task execution error: {e}"))
                    .await;
                (TaskStatus::Failed, None)
            }
        };

        match self
            .store
            .update(task.id, status, exit_code, None, Some(Utc::now()))
            .await
        {
            Ok(_) => {
                tracing::info!(task_id = %task.id, status = %status, exit_code, "Task finalized")
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Failed to persist terminal status")
            }
        }

        slot.done.cancel();
        self.sched.lock().await.release(task.id);
        self.pump().await;
    }

    async fn run_task(&self, task: &Task, cancel: &CancellationToken) -> Result<RunOutcome> {
        let mut child = match self
            .runner
            .spawn(task.id, &task.task_dir, &task.script_name)
        {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Task process failed to start");
                self.append_log(task, &format!("Failed to start task process: {e}"))
                    .await;
                return Err(e.into());
            }
        };

        self.runner
            .wait_with_cancel(task.id, &mut child, cancel)
            .await
    }

    /// Best-effort diagnostic line into the task's log.
    async fn append_log(&self, task: &Task, message: &str) {
        use tokio::io::AsyncWriteExt;

        let path = task.task_dir.join(LOG_FILE);
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(format!("{message}\n").as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(task_id = %task.id, error = %e, "Could not append to task log");
        }
    }
}
