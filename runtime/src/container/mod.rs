//! Container registry and job lifecycle.
//!
//! The registry lock guards the map of live containers and the set of issued
//! handles. Each container has its own lock over its lifecycle flag and its
//! running jobs; starting a job and retiring a container both take that lock,
//! so a command either starts before the container is retired (and is then
//! aborted by the retirement) or fails with an unknown handle.

mod handle;
mod job;

pub use handle::Handle;
pub use job::{Job, JobId, JobState};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use capsules_container_exec::{IsolationBackend, SpawnRequest};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{WardenError, WardenResult};
use handle::HandleAllocator;

/// Where job output lands and how long an aborted job may take to exit.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub capture_path: PathBuf,
    pub kill_grace: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            capture_path: std::env::temp_dir().join("warden").join("captures"),
            kill_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    Destroyed,
}

struct RunningJob {
    job: Arc<Job>,
    supervisor: JoinHandle<()>,
}

struct ContainerState {
    lifecycle: Lifecycle,
    jobs: HashMap<JobId, RunningJob>,
}

pub struct Container {
    handle: Handle,
    created_at: DateTime<Utc>,
    state: Mutex<ContainerState>,
}

impl Container {
    fn new(handle: Handle) -> Self {
        Self {
            handle,
            created_at: Utc::now(),
            state: Mutex::new(ContainerState {
                lifecycle: Lifecycle::Active,
                jobs: HashMap::new(),
            }),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    async fn start_job(
        self: &Arc<Self>,
        backend: &dyn IsolationBackend,
        settings: &RunSettings,
        command_line: String,
    ) -> WardenResult<Arc<Job>> {
        let mut state = self.state.lock().await;
        if state.lifecycle == Lifecycle::Destroyed {
            return Err(WardenError::UnknownHandle);
        }

        let id = JobId::new();
        let stdout = settings
            .capture_path
            .join(format!("{}-{}.stdout", self.handle, id));
        let stderr = settings
            .capture_path
            .join(format!("{}-{}.stderr", self.handle, id));

        let process = backend
            .spawn(
                self.handle.as_str(),
                SpawnRequest {
                    command_line: command_line.clone(),
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                },
            )
            .await?;
        debug!(handle = %self.handle, job = %id, pid = ?process.id(), command = %command_line, "job started");

        let job = Arc::new(Job::new(
            id,
            self.handle.clone(),
            command_line,
            stdout,
            stderr,
        ));
        let supervisor = job::supervise(job.clone(), process, self.clone(), settings.kill_grace);
        state.jobs.insert(
            id,
            RunningJob {
                job: job.clone(),
                supervisor,
            },
        );
        Ok(job)
    }

    async fn detach(&self, id: JobId) {
        self.state.lock().await.jobs.remove(&id);
    }

    /// Mark the container destroyed, abort its jobs and hand back their
    /// supervisors so the caller can wait for the processes to go away.
    async fn retire(&self) -> Vec<JoinHandle<()>> {
        let mut state = self.state.lock().await;
        state.lifecycle = Lifecycle::Destroyed;
        state
            .jobs
            .drain()
            .map(|(_, running)| {
                running.job.abort();
                running.supervisor
            })
            .collect()
    }
}

#[derive(Default)]
struct RegistryState {
    containers: HashMap<Handle, Arc<Container>>,
    handles: HandleAllocator,
    closed: bool,
}

/// Owns every live container and the backend that isolates them.
pub struct Registry {
    backend: Arc<dyn IsolationBackend>,
    settings: RunSettings,
    inner: Mutex<RegistryState>,
}

impl Registry {
    pub fn new(backend: Arc<dyn IsolationBackend>, settings: RunSettings) -> Self {
        Self {
            backend,
            settings,
            inner: Mutex::new(RegistryState::default()),
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.containers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn create(&self) -> WardenResult<Handle> {
        let handle = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(WardenError::internal("daemon is shutting down"));
            }
            inner.handles.allocate()?
        };

        self.backend.provision(handle.as_str()).await?;

        let container = Arc::new(Container::new(handle.clone()));
        let mut inner = self.inner.lock().await;
        if inner.closed {
            drop(inner);
            self.teardown(&handle).await;
            return Err(WardenError::internal("daemon is shutting down"));
        }
        inner.containers.insert(handle.clone(), container);
        info!(handle = %handle, live = inner.containers.len(), "container created");
        Ok(handle)
    }

    pub async fn lookup(&self, handle: &Handle) -> WardenResult<Arc<Container>> {
        self.inner
            .lock()
            .await
            .containers
            .get(handle)
            .cloned()
            .ok_or(WardenError::UnknownHandle)
    }

    /// Remove the container, abort its running jobs and tear down its
    /// environment in the background. Returns without waiting for the
    /// aborted processes to exit.
    pub async fn destroy(&self, handle: &Handle) -> WardenResult<()> {
        let container = self
            .inner
            .lock()
            .await
            .containers
            .remove(handle)
            .ok_or(WardenError::UnknownHandle)?;

        let supervisors = container.retire().await;
        let age = Utc::now() - container.created_at();
        info!(
            handle = %handle,
            aborted = supervisors.len(),
            age_ms = age.num_milliseconds(),
            "container destroyed"
        );

        let backend = self.backend.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            join_all(supervisors).await;
            if let Err(err) = backend.teardown(handle.as_str()).await {
                warn!(handle = %handle, error = %err, "container teardown failed");
            }
        });
        Ok(())
    }

    /// Start `command_line` in the container named by `handle`.
    pub async fn spawn_job(&self, handle: &Handle, command_line: String) -> WardenResult<Arc<Job>> {
        let container = self.lookup(handle).await?;
        container
            .start_job(self.backend.as_ref(), &self.settings, command_line)
            .await
    }

    /// Destroy every container and wait for their teardown. Later creates fail.
    pub async fn shutdown(&self) {
        let containers: Vec<Arc<Container>> = {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            inner.containers.drain().map(|(_, container)| container).collect()
        };
        if containers.is_empty() {
            return;
        }

        info!(count = containers.len(), "destroying remaining containers");
        join_all(containers.into_iter().map(|container| async move {
            let supervisors = container.retire().await;
            join_all(supervisors).await;
            self.teardown(container.handle()).await;
        }))
        .await;
    }

    async fn teardown(&self, handle: &Handle) {
        if let Err(err) = self.backend.teardown(handle.as_str()).await {
            warn!(handle = %handle, error = %err, "container teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsules_container_exec::{LocalBackend, LocalBackendConfig};
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> Registry {
        let backend = LocalBackend::new(LocalBackendConfig {
            depot_path: dir.path().join("depot"),
            ..LocalBackendConfig::default()
        });
        Registry::new(
            Arc::new(backend),
            RunSettings {
                capture_path: dir.path().join("captures"),
                kill_grace: Duration::from_millis(200),
            },
        )
    }

    #[tokio::test]
    async fn created_handles_are_distinct() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let first = registry.create().await.unwrap();
        let second = registry.create().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.len().await, 2);
        assert!(dir.path().join("depot").join(first.as_str()).join("root").is_dir());
    }

    #[tokio::test]
    async fn destroy_is_not_repeatable() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let handle = registry.create().await.unwrap();
        registry.destroy(&handle).await.unwrap();
        assert!(matches!(
            registry.destroy(&handle).await,
            Err(WardenError::UnknownHandle)
        ));
        assert!(matches!(
            registry.lookup(&handle).await,
            Err(WardenError::UnknownHandle)
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn completed_job_reports_exit_code_and_detaches() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let handle = registry.create().await.unwrap();
        let job = registry
            .spawn_job(&handle, "echo hi; exit 3".into())
            .await
            .unwrap();
        assert_eq!(job.wait().await, JobState::Completed(3));
        assert_eq!(std::fs::read_to_string(job.stdout_path()).unwrap(), "hi\n");

        // Already detached when the result becomes visible.
        let container = registry.lookup(&handle).await.unwrap();
        assert_eq!(container.job_count().await, 0);
    }

    #[tokio::test]
    async fn destroy_aborts_running_jobs() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let handle = registry.create().await.unwrap();
        let job = registry.spawn_job(&handle, "sleep 5".into()).await.unwrap();

        registry.destroy(&handle).await.unwrap();
        let state = tokio::time::timeout(Duration::from_secs(2), job.wait())
            .await
            .unwrap();
        assert_eq!(state, JobState::Aborted);
    }

    #[tokio::test]
    async fn run_after_destroy_is_unknown_handle() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let handle = registry.create().await.unwrap();
        let container = registry.lookup(&handle).await.unwrap();
        registry.destroy(&handle).await.unwrap();

        let started = container
            .start_job(registry.backend.as_ref(), registry.settings(), "true".into())
            .await;
        assert!(matches!(started, Err(WardenError::UnknownHandle)));
    }

    #[tokio::test]
    async fn shutdown_retires_everything_and_refuses_creates() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let handle = registry.create().await.unwrap();
        let job = registry.spawn_job(&handle, "sleep 5".into()).await.unwrap();

        registry.shutdown().await;
        assert_eq!(job.state(), JobState::Aborted);
        assert!(registry.is_empty().await);
        assert!(!dir.path().join("depot").join(handle.as_str()).exists());
        assert!(registry.create().await.unwrap_err().is_internal());
    }
}
