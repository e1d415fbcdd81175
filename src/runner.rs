//! Process runner: spawns and supervises one task's subprocess.
//!
//! The process runs with the task directory as its working directory,
//! identifying environment variables injected, and stdout + stderr both
//! appended to `log.txt` so the log can be tailed while the task runs.
//! Termination is two-phase: SIGTERM, a bounded grace period, then SIGKILL.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CancelError, Error, ProcessError};
use crate::stager::{FILES_DIR, LOG_FILE};

/// Environment variables injected into every task process.
pub const ENV_TASK_ID: &str = "RUNQ_TASK_ID";
pub const ENV_TASK_DIR: &str = "RUNQ_TASK_DIR";
pub const ENV_FILES_DIR: &str = "RUNQ_FILES_DIR";

/// How a supervised process finished.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited on its own. `code` is `None` when it was killed
    /// by a signal the runner did not send.
    Exited { code: Option<i32> },
    /// Cancellation was requested and termination is confirmed; the exit
    /// code is discarded.
    Cancelled,
}

/// Spawns task processes and waits on them with cancellation support.
pub struct ProcessRunner {
    interpreter: String,
    grace_period: Duration,
}

impl ProcessRunner {
    pub fn new(interpreter: String, grace_period: Duration) -> Self {
        Self {
            interpreter,
            grace_period,
        }
    }

    /// Start the task's script. The returned `Child` stays with the caller
    /// for the duration of the run so it can be signaled.
    pub fn spawn(
        &self,
        task_id: Uuid,
        task_dir: &Path,
        script_name: &str,
    ) -> Result<Child, ProcessError> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(task_dir.join(LOG_FILE))?;
        let log_err = log.try_clone()?;

        let task_dir_abs = std::path::absolute(task_dir)?;

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(script_name)
            .current_dir(&task_dir_abs)
            .env(ENV_TASK_ID, task_id.to_string())
            .env(ENV_TASK_DIR, &task_dir_abs)
            .env(ENV_FILES_DIR, task_dir_abs.join(FILES_DIR))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        tracing::debug!(
            task_id = %task_id,
            interpreter = %self.interpreter,
            script = %script_name,
            "Spawning task process"
        );

        cmd.spawn().map_err(|e| ProcessError::Spawn {
            id: task_id,
            reason: e.to_string(),
        })
    }

    /// Block on the process until it exits or cancellation is requested.
    /// This is the supervisor's only suspension point.
    pub async fn wait_with_cancel(
        &self,
        task_id: Uuid,
        child: &mut Child,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, Error> {
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| ProcessError::Wait {
                    id: task_id,
                    reason: e.to_string(),
                })?;
                Ok(RunOutcome::Exited { code: status.code() })
            }
            _ = cancel.cancelled() => {
                self.terminate(task_id, child).await?;
                Ok(RunOutcome::Cancelled)
            }
        }
    }

    /// Two-phase termination: graceful signal, grace period, forceful kill.
    async fn terminate(&self, task_id: Uuid, child: &mut Child) -> Result<(), Error> {
        send_term_signal(child);

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(_)) => {
                tracing::debug!(task_id = %task_id, "Process exited within grace period");
                return Ok(());
            }
            Ok(Err(e)) => {
                return Err(ProcessError::Wait {
                    id: task_id,
                    reason: e.to_string(),
                }
                .into());
            }
            Err(_) => {
                tracing::warn!(
                    task_id = %task_id,
                    grace = ?self.grace_period,
                    "Grace period elapsed; escalating to forceful kill"
                );
            }
        }

        // `Child::kill` sends SIGKILL and waits for the exit to be reaped.
        match tokio::time::timeout(self.grace_period, child.kill()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CancelError::TerminationTimeout {
                id: task_id,
                grace: self.grace_period,
                reason: e.to_string(),
            }
            .into()),
            Err(_) => Err(CancelError::TerminationTimeout {
                id: task_id,
                grace: self.grace_period,
                reason: "process still running after forceful kill".to_string(),
            }
            .into()),
        }
    }
}

#[cfg(unix)]
fn send_term_signal(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we own; failure is handled by the
        // forceful phase.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_term_signal(child: &Child) {
    // No graceful signal on this platform; the forceful phase does the work.
    let _ = child;
}
