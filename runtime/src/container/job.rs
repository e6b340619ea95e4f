use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use capsules_container_exec::ProcessHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Container, Handle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    Completed(i32),
    Aborted,
    /// The backend lost track of the process.
    Failed(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running)
    }
}

/// One execution of a command line inside a container.
///
/// The terminal state is written exactly once: whichever of process exit and
/// abort lands first wins, and later transitions are ignored.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    handle: Handle,
    command_line: String,
    stdout: PathBuf,
    stderr: PathBuf,
    state: watch::Sender<JobState>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        handle: Handle,
        command_line: String,
        stdout: PathBuf,
        stderr: PathBuf,
    ) -> Self {
        let (state, _) = watch::channel(JobState::Running);
        Self {
            id,
            handle,
            command_line,
            stdout,
            stderr,
            state,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr
    }

    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Returns true when this call moved the job out of `Running`.
    fn finish(&self, next: JobState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = next;
            true
        })
    }

    pub(crate) fn complete(&self, code: i32) -> bool {
        self.finish(JobState::Completed(code))
    }

    pub(crate) fn abort(&self) -> bool {
        self.finish(JobState::Aborted)
    }

    pub(crate) fn fail(&self, message: String) -> bool {
        self.finish(JobState::Failed(message))
    }

    /// Resolves with the terminal state, immediately if it is already set.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state.subscribe();
        let observed = match rx.wait_for(JobState::is_terminal).await {
            Ok(state) => Some(state.clone()),
            Err(_) => None,
        };
        observed.unwrap_or_else(|| self.state())
    }
}

/// Drive a spawned process to completion, or kill it when the job is aborted.
/// The job is detached from its container once the process is gone, and
/// before a natural exit is published to waiters.
pub(crate) fn supervise(
    job: Arc<Job>,
    mut process: Box<dyn ProcessHandle>,
    container: Arc<Container>,
    kill_grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pid = process.id();
        let exit = tokio::select! {
            exit = process.wait() => Some(exit),
            _ = job.wait() => None,
        };

        // Detach before publishing the result so a destroy issued after the
        // reply never sees a finished job.
        match exit {
            Some(Ok(report)) => {
                container.detach(job.id).await;
                if job.complete(report.code) {
                    debug!(handle = %job.handle, job = %job.id, pid = ?pid, code = report.code, "job finished");
                }
            }
            Some(Err(err)) => {
                warn!(handle = %job.handle, job = %job.id, pid = ?pid, error = %err, "lost track of job process");
                container.detach(job.id).await;
                job.fail(err.to_string());
            }
            None => {
                debug!(handle = %job.handle, job = %job.id, pid = ?pid, "job aborted, terminating process");
                if let Err(err) = process.terminate(kill_grace).await {
                    warn!(handle = %job.handle, job = %job.id, pid = ?pid, error = %err, "failed to terminate aborted job");
                }
                container.detach(job.id).await;
            }
        }
    })
}
